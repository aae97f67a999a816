use crate::model::Ms;

/// Earliest instant a booking may touch (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Latest instant a booking may touch (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One booking may not cover more than 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MIN_CANCEL_REASON_LEN: usize = 10;
pub const MAX_CANCEL_REASON_LEN: usize = 1_000;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Custom `Shp_*` parameters accepted on one payment intent.
pub const MAX_SHP_PARAMS: usize = 16;
pub const MAX_SHP_VALUE_LEN: usize = 256;

/// Money columns are `NUMERIC(12, 2)`.
pub const MONEY_SCALE: u32 = 2;
pub const MONEY_INTEGER_DIGITS: u32 = 10;

pub const MAX_BOOKINGS_PER_ROOM: usize = 1_000_000;
