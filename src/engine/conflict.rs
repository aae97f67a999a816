use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.is_empty() {
        return Err(EngineError::LimitExceeded("span must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Range exclusion over `(room, [start, end), status != cancelled)`.
/// Must be called with the room's write lock held.
pub(crate) fn check_no_overlap(rs: &RoomState, span: &Span) -> Result<(), EngineError> {
    match rs.active_overlapping(span).next() {
        Some(existing) => Err(EngineError::Overlap {
            room_id: rs.id,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}
