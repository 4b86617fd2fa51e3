use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::find_conflict;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_well_formed() {
        return Err(EngineError::InvalidSpan(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_draft(draft: &BookingDraft) -> Result<(), EngineError> {
    if draft.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    for text in [&draft.description, &draft.location, &draft.meeting_url, &draft.notes]
        .into_iter()
        .flatten()
    {
        if text.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("text field too long"));
        }
    }
    Ok(())
}

pub(crate) fn check_client(cal: &CalendarState, client_id: Option<Ulid>) -> Result<(), EngineError> {
    match client_id {
        Some(cid) if !cal.clients.contains_key(&cid) => Err(EngineError::NotFound(cid)),
        _ => Ok(()),
    }
}

/// Fails with the id of the first active booking overlapping `span`.
/// Cancelled bookings free their slot; `exclude` lets a booking move within its own slot.
pub(crate) fn check_no_conflict(
    cal: &CalendarState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let active = cal
        .overlapping(span)
        .filter(|b| b.status != BookingStatus::Cancelled);
    match find_conflict(active, span, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}
