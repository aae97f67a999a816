//! Payment initiation and gateway callback reconciliation.

mod initiator;
mod reconciler;
pub mod signature;

pub use initiator::{InvoiceIds, PaymentInit, PaymentRequest};
pub use reconciler::{CallbackCheck, CallbackParams, Channel, ResultAck, Verdict};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::booking::BookingService;
use crate::store::PaymentRepository;

/// Merchant credentials for the payment gateway.
#[derive(Clone)]
pub struct GatewayConfig {
    pub merchant_login: String,
    /// Signs outbound requests and success redirects.
    pub password1: String,
    /// Signs result callbacks.
    pub password2: String,
    pub payment_url: String,
    pub test_mode: bool,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("merchant_login", &self.merchant_login)
            .field("password1", &"<redacted>")
            .field("password2", &"<redacted>")
            .field("payment_url", &self.payment_url)
            .field("test_mode", &self.test_mode)
            .finish()
    }
}

pub struct PaymentService {
    payments: Arc<dyn PaymentRepository>,
    bookings: Arc<BookingService>,
    gateway: GatewayConfig,
    invoice_ids: InvoiceIds,
    storage_timeout: Duration,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        bookings: Arc<BookingService>,
        gateway: GatewayConfig,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            payments,
            bookings,
            gateway,
            invoice_ids: InvoiceIds::new(),
            storage_timeout,
        }
    }
}
