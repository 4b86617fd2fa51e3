use ulid::Ulid;

use crate::model::{BookingStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Requested span overlaps the given existing booking.
    Conflict(Ulid),
    InvalidSpan(Span),
    InvalidState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "time slot overlaps with an existing booking: {id}")
            }
            EngineError::InvalidSpan(span) => write!(
                f,
                "end time must be after start time: [{}, {})",
                span.start, span.end
            ),
            EngineError::InvalidState { id, status, action } => {
                write!(f, "cannot {action} a {status} booking: {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
