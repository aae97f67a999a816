//! Repository seams between the services and a storage backend.
//!
//! Every read-modify-write runs its check inside the backend's lock (room
//! write lock or `SELECT ... FOR UPDATE`), so the services never hold a lock
//! of their own across requests.

mod embedded;
pub mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::booking::BookingChange;
use crate::error::{Error, Result};
use crate::model::{Booking, BookingId, InvoiceId, PaymentIntent, RoomId, Span};
use crate::payment::{CallbackCheck, Verdict};

/// A record after a read-modify-write, and whether the write happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modified<T> {
    pub record: T,
    pub changed: bool,
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Store a new booking. Overlap with a non-cancelled booking on the same
    /// room fails with [`Error::Overbooking`].
    async fn insert(&self, booking: Booking) -> Result<Booking>;

    async fn get(&self, id: BookingId) -> Result<Option<Booking>>;

    /// Spans of non-cancelled bookings on `room` that overlap `window`.
    async fn busy_spans(&self, room: RoomId, window: Span) -> Result<Vec<Span>>;

    /// Apply `change` to the locked current record.
    async fn modify(&self, id: BookingId, change: &BookingChange) -> Result<Modified<Booking>>;

    /// Backend name and liveness for the health endpoint.
    async fn ping(&self) -> Result<&'static str>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Store a new intent. A taken invoice id is a storage error.
    async fn insert_intent(&self, intent: PaymentIntent) -> Result<PaymentIntent>;

    async fn get_intent(&self, inv_id: InvoiceId) -> Result<Option<PaymentIntent>>;

    /// Run `check` against the locked current intent and persist the outcome,
    /// including failure states.
    async fn reconcile(
        &self,
        inv_id: InvoiceId,
        check: &CallbackCheck,
    ) -> Result<(Modified<PaymentIntent>, Verdict)>;
}

/// Bound a storage call. Expiry drops the in-flight future.
pub async fn deadline<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            metrics::counter!(crate::observability::STORAGE_TIMEOUTS_TOTAL).increment(1);
            tracing::warn!(limit_ms = limit.as_millis() as u64, "storage deadline exceeded");
            Err(Error::StorageTimeout)
        }
    }
}
