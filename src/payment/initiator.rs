use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::booking::{Actor, check_money};
use crate::error::{Error, Result};
use crate::limits::{MAX_DESCRIPTION_LEN, MAX_SHP_PARAMS, MAX_SHP_VALUE_LEN};
use crate::model::{
    BookingId, BookingPaymentStatus, BookingStatus, IntentStatus, InvoiceId, PaymentIntent,
};
use crate::observability;
use crate::store::deadline;

use super::PaymentService;
use super::signature::{SHP_PREFIX, is_shp_key, parse_amount, sign};

/// Invoice numbers from the microsecond clock, strictly increasing within
/// the process even when the clock stalls or steps back.
pub struct InvoiceIds {
    last: AtomicI64,
}

impl InvoiceIds {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> InvoiceId {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

impl Default for InvoiceIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub booking_id: BookingId,
    pub out_sum: String,
    pub description: String,
    pub shp_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentInit {
    pub inv_id: InvoiceId,
    pub payment_url: String,
    pub signature: String,
    pub status: IntentStatus,
}

fn normalize_shp(params: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    if params.len() > MAX_SHP_PARAMS {
        return Err(Error::Validation(format!(
            "at most {MAX_SHP_PARAMS} custom parameters are allowed"
        )));
    }
    let mut normalized = BTreeMap::new();
    for (key, value) in params {
        let key = key.trim();
        let bare = if is_shp_key(key) {
            &key[SHP_PREFIX.len()..]
        } else {
            key
        };
        if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Validation(format!("invalid custom parameter name: {key:?}")));
        }
        if value.chars().count() > MAX_SHP_VALUE_LEN {
            return Err(Error::Validation(format!("custom parameter {bare} is too long")));
        }
        let full = format!("{SHP_PREFIX}{bare}");
        if normalized.insert(full, value.clone()).is_some() {
            return Err(Error::Validation(format!("duplicate custom parameter: {bare}")));
        }
    }
    Ok(normalized)
}

impl PaymentService {
    /// Create a signed payment intent for a booking and build the gateway URL.
    pub async fn init(&self, actor: &Actor, req: PaymentRequest) -> Result<PaymentInit> {
        let amount = parse_amount(&req.out_sum)
            .filter(|a| *a > Decimal::ZERO)
            .ok_or_else(|| Error::Validation("out_sum must be a positive decimal".into()))?;
        let amount = check_money(amount, "out_sum")?;
        let description = req.description.trim().to_string();
        if description.is_empty() || description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(Error::Validation(format!(
                "description must be 1 to {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        let shp = normalize_shp(&req.shp_params)?;

        let booking = self.bookings.get(actor, req.booking_id).await?;
        if booking.status == BookingStatus::Cancelled {
            return Err(Error::InvalidStatusTransition(
                "cannot pay for a cancelled booking".into(),
            ));
        }

        let inv_id = self.invoice_ids.next();
        let out_sum = amount.to_string();
        let inv_text = inv_id.to_string();
        let gw = &self.gateway;
        let signature = sign(
            &[
                gw.merchant_login.as_str(),
                out_sum.as_str(),
                inv_text.as_str(),
                gw.password1.as_str(),
            ],
            &shp,
        );

        let now = Utc::now();
        let intent = PaymentIntent {
            inv_id,
            booking_id: booking.id,
            amount,
            description: description.clone(),
            shp_params: shp.clone(),
            status: IntentStatus::Created,
            signature: signature.clone(),
            failure_reason: None,
            result_payload: None,
            success_payload: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        let intent = deadline(self.storage_timeout, self.payments.insert_intent(intent)).await?;

        if let Err(e) = self
            .bookings
            .sync_payment_status(booking.id, BookingPaymentStatus::Unpaid)
            .await
        {
            tracing::warn!(
                booking_id = %booking.id,
                error = %e,
                "failed to reset booking payment status"
            );
        }

        let mut query: Vec<(&str, &str)> = vec![
            ("MerchantLogin", gw.merchant_login.as_str()),
            ("OutSum", out_sum.as_str()),
            ("InvId", inv_text.as_str()),
            ("Description", description.as_str()),
            ("SignatureValue", signature.as_str()),
        ];
        if gw.test_mode {
            query.push(("IsTest", "1"));
        }
        query.extend(shp.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let encoded = serde_urlencoded::to_string(&query)
            .map_err(|e| Error::Storage(format!("failed to encode payment url: {e}")))?;

        metrics::counter!(observability::PAYMENT_INTENTS_CREATED_TOTAL).increment(1);
        tracing::info!(
            inv_id,
            booking_id = %booking.id,
            amount = %amount,
            "payment intent created"
        );

        Ok(PaymentInit {
            inv_id,
            payment_url: format!("{}?{encoded}", gw.payment_url),
            signature,
            status: intent.status,
        })
    }
}
