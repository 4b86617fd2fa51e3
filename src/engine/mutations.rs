use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_client, check_no_conflict, now_ms, validate_draft, validate_span};
use super::overlap::detect_overlaps;
use super::{apply_event, Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_client(
        &self,
        id: Ulid,
        name: String,
        email: Option<String>,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("client name too long"));
        }
        if let Some(ref e) = email
            && e.len() > MAX_EMAIL_LEN {
                return Err(EngineError::LimitExceeded("client email too long"));
            }
        let mut cal = self.calendar.write().await;
        if cal.clients.len() >= MAX_CLIENTS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many clients"));
        }
        if cal.clients.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ClientCreated { id, name, email };
        self.persist_and_apply(&mut cal, &event).await
    }

    /// Delete a client. Its bookings stay on the calendar with no client attached.
    pub async fn delete_client(&self, id: Ulid) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        if !cal.clients.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ClientDeleted { id };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn create_booking(
        &self,
        id: Ulid,
        draft: BookingDraft,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_draft(&draft)?;
        let mut cal = self.calendar.write().await;
        if cal.bookings.len() >= MAX_BOOKINGS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if cal.booking(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        check_client(&cal, draft.client_id)?;
        check_no_conflict(&cal, &span, None)?;

        let event = booking_created(id, draft, span, now_ms());
        self.persist_and_apply(&mut cal, &event).await
    }

    /// Atomically create several bookings. All-or-nothing: if any booking conflicts
    /// with the calendar or with another booking in the batch, none are committed.
    pub async fn batch_create_bookings(
        &self,
        bookings: Vec<(Ulid, BookingDraft, Span)>,
    ) -> Result<(), EngineError> {
        if bookings.is_empty() {
            return Ok(());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (_, draft, span) in &bookings {
            validate_span(span)?;
            validate_draft(draft)?;
        }

        let mut cal = self.calendar.write().await;
        if cal.bookings.len() + bookings.len() > MAX_BOOKINGS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        // Phase 1: validate every booking against stored state, then intra-batch.
        let mut seen = std::collections::HashSet::with_capacity(bookings.len());
        for (id, draft, span) in &bookings {
            if cal.booking(id).is_some() || !seen.insert(*id) {
                return Err(EngineError::AlreadyExists(*id));
            }
            check_client(&cal, draft.client_id)?;
            check_no_conflict(&cal, span, None)?;
        }
        let slots: Vec<(Ulid, Span)> = bookings.iter().map(|(id, _, span)| (*id, *span)).collect();
        let clashing = detect_overlaps(&slots);
        if let Some((id, _)) = slots.iter().find(|(id, _)| clashing.contains(id)) {
            return Err(EngineError::Conflict(*id));
        }

        // Phase 2: one WAL write for the whole batch, then apply.
        let now = now_ms();
        let events: Vec<Event> = bookings
            .into_iter()
            .map(|(id, draft, span)| booking_created(id, draft, span, now))
            .collect();
        self.wal_append_all(events.clone()).await?;
        for event in &events {
            apply_event(&mut cal, event);
            self.notify.send(event);
        }
        Ok(())
    }

    /// Replace a booking's editable fields, span, and status.
    pub async fn update_booking(
        &self,
        id: Ulid,
        draft: BookingDraft,
        span: Span,
        status: Option<BookingStatus>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_draft(&draft)?;
        let mut cal = self.calendar.write().await;
        let current = cal.booking(&id).ok_or(EngineError::NotFound(id))?.status;
        check_client(&cal, draft.client_id)?;
        check_no_conflict(&cal, &span, Some(id))?;

        let event = Event::BookingUpdated {
            id,
            client_id: draft.client_id,
            title: draft.title,
            description: draft.description,
            span,
            location: draft.location,
            meeting_url: draft.meeting_url,
            notes: draft.notes,
            status: status.unwrap_or(current),
            updated_at: now_ms(),
        };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn reschedule_booking(&self, id: Ulid, span: Span) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        let booking = cal.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
                action: "reschedule",
            });
        }
        validate_span(&span)?;
        check_no_conflict(&cal, &span, Some(id))?;

        let event = Event::BookingRescheduled { id, span, updated_at: now_ms() };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, BookingStatus::Cancelled, BookingStatus::Completed, "cancel")
            .await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, BookingStatus::Completed, BookingStatus::Cancelled, "complete")
            .await
    }

    /// Move a booking to `to` unless it currently sits in `forbidden_from`.
    async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        forbidden_from: BookingStatus,
        action: &'static str,
    ) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        let status = cal.booking(&id).ok_or(EngineError::NotFound(id))?.status;
        if status == forbidden_from {
            return Err(EngineError::InvalidState { id, status, action });
        }
        let event = Event::BookingStatusChanged { id, status: to, updated_at: now_ms() };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        if cal.booking(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BookingDeleted { id };
        self.persist_and_apply(&mut cal, &event).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Hold the read lock until the writer has the snapshot queued, so no
        // mutation can land in the WAL between snapshot and swap.
        let cal = self.calendar.read().await;
        let mut events = Vec::with_capacity(cal.clients.len() + cal.bookings.len());
        for client in cal.clients.values() {
            events.push(Event::ClientCreated {
                id: client.id,
                name: client.name.clone(),
                email: client.email.clone(),
            });
        }
        for booking in &cal.bookings {
            events.push(Event::created_from(booking));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        drop(cal);
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn booking_created(id: Ulid, draft: BookingDraft, span: Span, now: Ms) -> Event {
    Event::BookingCreated {
        id,
        client_id: draft.client_id,
        title: draft.title,
        description: draft.description,
        span,
        location: draft.location,
        meeting_url: draft.meeting_url,
        notes: draft.notes,
        status: BookingStatus::Confirmed,
        created_at: now,
        updated_at: None,
    }
}
