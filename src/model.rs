use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the time unit for interval arithmetic.
pub type Ms = i64;

pub type BookingId = Ulid;
pub type RoomId = Ulid;
pub type StudioId = Ulid;
pub type UserId = Ulid;
/// Gateway invoice number (`InvId`), one per settlement attempt.
pub type InvoiceId = i64;

/// Raw key/value parameters exactly as a gateway callback delivered them.
pub type RawPayload = BTreeMap<String, String>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn from_instants(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    /// Empty or inverted.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `window`, or `None` when nothing is left.
    pub fn clip(&self, window: &Span) -> Option<Span> {
        let clipped = Span::new(self.start.max(window.start), self.end.min(window.end));
        (!clipped.is_empty()).then_some(clipped)
    }
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

text_enum!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
});

impl BookingStatus {
    /// Whether a booking in this status still occupies its room.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPaymentStatus {
    Unpaid,
    Paid,
}

text_enum!(BookingPaymentStatus {
    Unpaid => "unpaid",
    Paid => "paid",
});

/// A reservation of one room for `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub studio_id: StudioId,
    pub renter_id: UserId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_amount: Decimal,
    pub status: BookingStatus,
    pub payment_status: BookingPaymentStatus,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_instants(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Created,
    Pending,
    Paid,
    Failed,
}

text_enum!(IntentStatus {
    Created => "created",
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
});

/// One signed settlement attempt for a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub inv_id: InvoiceId,
    pub booking_id: BookingId,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub description: String,
    pub shp_params: BTreeMap<String, String>,
    pub status: IntentStatus,
    pub signature: String,
    pub failure_reason: Option<String>,
    pub result_payload: Option<RawPayload>,
    pub success_payload: Option<RawPayload>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-room booking list kept by the embedded engine.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: RoomId,
    /// All bookings ever made on the room (cancelled included), sorted by `start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.start <= booking.start);
        self.bookings.insert(pos, booking);
    }

    /// Replace a booking in place. Start and end never change after creation,
    /// so the sort order is preserved.
    pub fn replace_booking(&mut self, booking: Booking) -> Option<Booking> {
        let slot = self.bookings.iter_mut().find(|b| b.id == booking.id)?;
        Some(std::mem::replace(slot, booking))
    }

    pub fn booking(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.start.timestamp_millis() < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end.timestamp_millis() > query.start)
    }

    /// Overlapping bookings that still hold the slot.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.holds_slot())
    }
}

/// The WAL record format. Each variant carries a full snapshot, so replay is
/// an upsert and never depends on the previous value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated { booking: Booking },
    BookingChanged { booking: Booking },
    IntentCreated { intent: PaymentIntent },
    IntentChanged { intent: PaymentIntent },
}
