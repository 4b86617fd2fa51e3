use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::overlap::detect_overlaps;
use super::{Engine, EngineError};

fn booking_info(cal: &CalendarState, b: &Booking) -> BookingInfo {
    let client = b.client_id.and_then(|cid| cal.clients.get(&cid));
    BookingInfo {
        id: b.id,
        client_id: b.client_id,
        client_name: client.map(|c| c.name.clone()),
        client_email: client.and_then(|c| c.email.clone()),
        title: b.title.clone(),
        description: b.description.clone(),
        start: b.span.start,
        end: b.span.end,
        location: b.location.clone(),
        meeting_url: b.meeting_url.clone(),
        notes: b.notes.clone(),
        status: b.status,
        created_at: b.created_at,
        updated_at: b.updated_at,
    }
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let cal = self.calendar.read().await;
        cal.booking(&id)
            .map(|b| booking_info(&cal, b))
            .ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching `filter`, ordered by start time.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<BookingInfo> {
        let cal = self.calendar.read().await;
        cal.bookings
            .iter()
            .filter(|b| filter.matches(b))
            .map(|b| booking_info(&cal, b))
            .collect()
    }

    /// The next `count` confirmed bookings starting strictly after `now`.
    pub async fn upcoming_bookings(&self, now: Ms, count: usize) -> Vec<BookingInfo> {
        let count = count.min(MAX_UPCOMING_COUNT);
        let cal = self.calendar.read().await;
        let first_after = cal.bookings.partition_point(|b| b.span.start <= now);
        cal.bookings[first_after..]
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .take(count)
            .map(|b| booking_info(&cal, b))
            .collect()
    }

    /// True when no active booking other than `exclude` overlaps `span`.
    pub async fn is_available(&self, span: Span, exclude: Option<Ulid>) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let cal = self.calendar.read().await;
        match check_no_conflict(&cal, &span, exclude) {
            Ok(()) => Ok(true),
            Err(EngineError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Bookings matching `filter` that overlap at least one other matching booking.
    pub async fn overlapping_bookings(&self, filter: &BookingFilter) -> Vec<BookingInfo> {
        let listed = self.list_bookings(filter).await;
        let overlapping = detect_overlaps(&listed);
        listed
            .into_iter()
            .filter(|b| overlapping.contains(&b.id))
            .collect()
    }

    /// All clients, sorted by name.
    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        let cal = self.calendar.read().await;
        let mut clients: Vec<ClientInfo> = cal
            .clients
            .values()
            .map(|c| ClientInfo {
                id: c.id,
                name: c.name.clone(),
                email: c.email.clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        clients
    }

    pub async fn booking_count(&self) -> usize {
        self.calendar.read().await.bookings.len()
    }
}
