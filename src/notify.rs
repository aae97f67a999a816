use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{BookingId, InvoiceId, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// Side-effect message sent to a booking's counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingRequested { booking_id: BookingId },
    BookingConfirmed { booking_id: BookingId },
    BookingCancelled { booking_id: BookingId, reason: String },
    BookingCompleted { booking_id: BookingId },
    PaymentReceived {
        booking_id: BookingId,
        inv_id: InvoiceId,
        amount: Decimal,
    },
}

/// Fire-and-forget delivery. Implementations must not block and never fail
/// the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient: UserId, notification: Notification);
}

/// Per-user broadcast channels. Delivery transports subscribe here.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user: UserId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, recipient: UserId, notification: Notification) {
        match self.channels.get(&recipient) {
            Some(sender) => {
                if sender.send(notification).is_err() {
                    tracing::debug!(%recipient, "notification dropped: no active receivers");
                }
            }
            None => tracing::debug!(%recipient, ?notification, "no subscriber for notification"),
        }
    }
}
