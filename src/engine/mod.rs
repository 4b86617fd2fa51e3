mod conflict;
mod error;
mod mutations;
mod overlap;
mod queries;
#[cfg(test)]
mod tests;

pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use overlap::{detect_overlaps, find_conflict};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendBatch {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error: buffered bytes must not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::AppendBatch { events, response } => {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                .record(events.len() as f64);
            let result = wal.append_all(&events);
            if let Err(e) = &result {
                tracing::error!("WAL batch append failed for {} events: {e}", events.len());
            }
            let _ = response.send(result);
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's calendar engine: in-memory state, WAL writer handle, notify hub.
pub struct Engine {
    pub(super) calendar: RwLock<CalendarState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply an event directly to a CalendarState (caller holds the lock).
pub(super) fn apply_event(cal: &mut CalendarState, event: &Event) {
    match event {
        Event::ClientCreated { id, name, email } => {
            cal.clients.insert(
                *id,
                Client {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                },
            );
        }
        Event::ClientDeleted { id } => {
            cal.clients.remove(id);
            // Bookings outlive their client; the reference is cleared.
            for booking in cal.bookings.iter_mut() {
                if booking.client_id == Some(*id) {
                    booking.client_id = None;
                }
            }
        }
        Event::BookingCreated {
            id,
            client_id,
            title,
            description,
            span,
            location,
            meeting_url,
            notes,
            status,
            created_at,
            updated_at,
        } => {
            cal.insert_booking(Booking {
                id: *id,
                client_id: *client_id,
                title: title.clone(),
                description: description.clone(),
                span: *span,
                location: location.clone(),
                meeting_url: meeting_url.clone(),
                notes: notes.clone(),
                status: *status,
                created_at: *created_at,
                updated_at: *updated_at,
            });
        }
        Event::BookingUpdated {
            id,
            client_id,
            title,
            description,
            span,
            location,
            meeting_url,
            notes,
            status,
            updated_at,
        } => {
            if let Some(mut booking) = cal.remove_booking(*id) {
                booking.client_id = *client_id;
                booking.title = title.clone();
                booking.description = description.clone();
                booking.span = *span;
                booking.location = location.clone();
                booking.meeting_url = meeting_url.clone();
                booking.notes = notes.clone();
                booking.status = *status;
                booking.updated_at = Some(*updated_at);
                cal.insert_booking(booking);
            }
        }
        Event::BookingRescheduled { id, span, updated_at } => {
            // Remove + insert keeps the start-time order intact.
            if let Some(mut booking) = cal.remove_booking(*id) {
                booking.span = *span;
                booking.updated_at = Some(*updated_at);
                cal.insert_booking(booking);
            }
        }
        Event::BookingStatusChanged { id, status, updated_at } => {
            if let Some(booking) = cal.bookings.iter_mut().find(|b| b.id == *id) {
                booking.status = *status;
                booking.updated_at = Some(*updated_at);
            }
        }
        Event::BookingDeleted { id } => {
            cal.remove_booking(*id);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = CalendarState::new();
        for event in &events {
            apply_event(&mut state, event);
        }
        tracing::debug!(
            "replayed {} events from {}: {} clients, {} bookings",
            events.len(),
            wal_path.display(),
            state.clients.len(),
            state.bookings.len()
        );

        Ok(Self {
            calendar: RwLock::new(state),
            wal_tx,
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Write several events to the WAL as one unit: all durable or none.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendBatch { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(cal, event);
        self.notify.send(event);
        Ok(())
    }
}
