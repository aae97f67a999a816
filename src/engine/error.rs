use crate::model::{BookingId, RoomId};

#[derive(Debug)]
pub enum EngineError {
    NotFound(String),
    AlreadyExists(String),
    /// The candidate span overlaps a booking that still holds the room.
    Overlap {
        room_id: RoomId,
        existing: BookingId,
    },
    LockTimeout,
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Overlap { room_id, existing } => {
                write!(f, "room {room_id} overlaps booking {existing}")
            }
            EngineError::LockTimeout => write!(f, "timed out waiting for record lock"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
