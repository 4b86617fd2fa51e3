use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict comparison: spans that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// Anything with an identity and a time span. The overlap scan works over these.
pub trait Scheduled {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

impl Scheduled for (Ulid, Span) {
    fn id(&self) -> Ulid {
        self.0
    }

    fn span(&self) -> Span {
        self.1
    }
}

/// Caller-editable booking fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingDraft {
    pub client_id: Option<Ulid>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub meeting_url: Option<String>,
    pub notes: Option<String>,
}

impl BookingDraft {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Option<Ulid>,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub location: Option<String>,
    pub meeting_url: Option<String>,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Option<Ms>,
}

impl Scheduled for Booking {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

/// One tenant's calendar: clients plus bookings sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct CalendarState {
    pub clients: HashMap<Ulid, Client>,
    pub bookings: Vec<Booking>,
}

impl CalendarState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// Filters for listing bookings. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    /// booking.start >= start_from
    pub start_from: Option<Ms>,
    /// booking.end <= end_until
    pub end_until: Option<Ms>,
    pub client_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.start_from.is_none_or(|s| booking.span.start >= s)
            && self.end_until.is_none_or(|e| booking.span.end <= e)
            && self.client_id.is_none_or(|c| booking.client_id == Some(c))
            && self.status.is_none_or(|s| booking.status == s)
    }
}

/// Flat events, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClientCreated {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    ClientDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        client_id: Option<Ulid>,
        title: String,
        description: Option<String>,
        span: Span,
        location: Option<String>,
        meeting_url: Option<String>,
        notes: Option<String>,
        status: BookingStatus,
        created_at: Ms,
        updated_at: Option<Ms>,
    },
    BookingUpdated {
        id: Ulid,
        client_id: Option<Ulid>,
        title: String,
        description: Option<String>,
        span: Span,
        location: Option<String>,
        meeting_url: Option<String>,
        notes: Option<String>,
        status: BookingStatus,
        updated_at: Ms,
    },
    BookingRescheduled {
        id: Ulid,
        span: Span,
        updated_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        updated_at: Ms,
    },
    BookingDeleted {
        id: Ulid,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ClientCreated { .. } => "client_created",
            Event::ClientDeleted { .. } => "client_deleted",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingUpdated { .. } => "booking_updated",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::BookingDeleted { .. } => "booking_deleted",
        }
    }

    pub fn entity_id(&self) -> Ulid {
        match self {
            Event::ClientCreated { id, .. }
            | Event::ClientDeleted { id }
            | Event::BookingCreated { id, .. }
            | Event::BookingUpdated { id, .. }
            | Event::BookingRescheduled { id, .. }
            | Event::BookingStatusChanged { id, .. }
            | Event::BookingDeleted { id } => *id,
        }
    }

    /// Recreate the event that brings a booking into existence as-is.
    pub fn created_from(booking: &Booking) -> Self {
        Event::BookingCreated {
            id: booking.id,
            client_id: booking.client_id,
            title: booking.title.clone(),
            description: booking.description.clone(),
            span: booking.span,
            location: booking.location.clone(),
            meeting_url: booking.meeting_url.clone(),
            notes: booking.notes.clone(),
            status: booking.status,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub client_id: Option<Ulid>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub location: Option<String>,
    pub meeting_url: Option<String>,
    pub notes: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Option<Ms>,
}

impl BookingInfo {
    pub fn duration_minutes(&self) -> Ms {
        (self.end - self.start) / 60_000
    }
}

impl Scheduled for BookingInfo {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        // Struct literal on purpose: stored spans are validated, but the
        // overlap scan must tolerate whatever it is handed.
        Span {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}
