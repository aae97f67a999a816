use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::model::{BookingPaymentStatus, IntentStatus, InvoiceId, PaymentIntent, RawPayload};
use crate::notify::Notification;
use crate::observability;
use crate::store::deadline;

use super::PaymentService;
use super::signature::{is_shp_key, parse_amount, sign, verify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Server-to-server settlement notice, signed with password 2.
    Result,
    /// Browser redirect after checkout, signed with password 1.
    Success,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Result => "result",
            Channel::Success => "success",
        }
    }
}

/// What a callback did to its intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The intent became paid.
    Applied,
    /// The intent was already paid; nothing changed.
    AlreadyApplied,
    /// A valid success redirect was recorded.
    Acknowledged,
    InvalidSignature,
    AmountMismatch,
    /// A valid settlement for an intent that had already failed.
    AlreadyFailed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Applied => "applied",
            Verdict::AlreadyApplied => "already_applied",
            Verdict::Acknowledged => "acknowledged",
            Verdict::InvalidSignature => "invalid_signature",
            Verdict::AmountMismatch => "amount_mismatch",
            Verdict::AlreadyFailed => "already_failed",
        }
    }
}

/// Fields of one gateway callback. Keys are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct CallbackParams {
    pub out_sum: String,
    pub inv_id: InvoiceId,
    /// `InvId` exactly as received; the signature covers this text.
    pub inv_id_text: String,
    pub signature: String,
    pub shp: RawPayload,
    pub raw: RawPayload,
}

impl CallbackParams {
    pub fn from_form(raw: RawPayload) -> Result<Self> {
        let field = |name: &str| {
            raw.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim().to_string())
        };
        let inv_id_text =
            field("InvId").ok_or_else(|| Error::Validation("InvId is required".into()))?;
        let inv_id = inv_id_text
            .parse()
            .map_err(|_| Error::Validation(format!("invalid InvId: {inv_id_text:?}")))?;
        let shp = raw
            .iter()
            .filter(|(k, _)| is_shp_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            out_sum: field("OutSum").unwrap_or_default(),
            inv_id,
            inv_id_text,
            signature: field("SignatureValue").unwrap_or_default(),
            shp,
            raw,
        })
    }

    fn signature_valid(&self, password: &str) -> bool {
        let expected = sign(
            &[self.out_sum.as_str(), self.inv_id_text.as_str(), password],
            &self.shp,
        );
        verify(&expected, &self.signature)
    }
}

/// A verified callback, applied to the intent inside the repository's lock.
#[derive(Debug, Clone)]
pub struct CallbackCheck {
    pub channel: Channel,
    pub signature_valid: bool,
    /// Parsed `OutSum`; `None` when it did not parse.
    pub amount: Option<Decimal>,
    pub payload: RawPayload,
    pub at: DateTime<Utc>,
}

impl CallbackCheck {
    /// Decide the verdict against the current intent and edit it in place.
    /// A paid intent keeps its status; only the success channel's audit
    /// payload is still recorded on it.
    pub fn apply(&self, intent: &mut PaymentIntent) -> Verdict {
        use IntentStatus as S;

        let verdict = if !self.signature_valid {
            Verdict::InvalidSignature
        } else if self.amount != Some(intent.amount) {
            Verdict::AmountMismatch
        } else {
            match (self.channel, intent.status) {
                (Channel::Result, S::Paid) => Verdict::AlreadyApplied,
                (Channel::Result, S::Failed) => Verdict::AlreadyFailed,
                (Channel::Result, S::Created | S::Pending) => Verdict::Applied,
                (Channel::Success, _) => Verdict::Acknowledged,
            }
        };
        if intent.status == S::Paid && self.channel == Channel::Result {
            return verdict;
        }

        let changed = match (self.channel, verdict) {
            (Channel::Result, Verdict::Applied) => {
                intent.status = S::Paid;
                intent.paid_at = Some(self.at);
                intent.result_payload = Some(self.payload.clone());
                true
            }
            (Channel::Result, Verdict::InvalidSignature | Verdict::AmountMismatch)
                if intent.status != S::Failed =>
            {
                let reason = if verdict == Verdict::InvalidSignature {
                    "invalid signature"
                } else {
                    "amount mismatch"
                };
                intent.status = S::Failed;
                intent.failure_reason = Some(reason.to_string());
                intent.result_payload = Some(self.payload.clone());
                true
            }
            (Channel::Result, _) => false,
            (Channel::Success, verdict) => {
                let before = intent.clone();
                intent.success_payload = Some(self.payload.clone());
                if verdict == Verdict::Acknowledged && intent.status == S::Created {
                    intent.status = S::Pending;
                }
                *intent != before
            }
        };
        if changed {
            intent.updated_at = self.at;
        }
        verdict
    }
}

/// Acknowledgement the gateway expects from the result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultAck {
    pub inv_id: InvoiceId,
}

impl ResultAck {
    pub fn body(&self) -> String {
        format!("OK{}", self.inv_id)
    }
}

impl PaymentService {
    /// Result channel. Marks the intent paid at most once and syncs the booking.
    pub async fn handle_result(&self, form: RawPayload) -> Result<ResultAck> {
        let params = CallbackParams::from_form(form)?;
        let (intent, verdict) = self.reconcile(Channel::Result, &params).await?;
        let ack = ResultAck {
            inv_id: params.inv_id,
        };

        match verdict {
            Verdict::Applied => {
                tracing::info!(
                    inv_id = params.inv_id,
                    booking_id = %intent.booking_id,
                    "payment settled"
                );
                if let Err(e) = self
                    .bookings
                    .sync_payment_status(intent.booking_id, BookingPaymentStatus::Paid)
                    .await
                {
                    tracing::error!(
                        inv_id = params.inv_id,
                        booking_id = %intent.booking_id,
                        error = %e,
                        "failed to mark booking paid"
                    );
                }
                self.bookings
                    .notify_payment(
                        intent.booking_id,
                        Notification::PaymentReceived {
                            booking_id: intent.booking_id,
                            inv_id: intent.inv_id,
                            amount: intent.amount,
                        },
                    )
                    .await;
                Ok(ack)
            }
            Verdict::AlreadyApplied | Verdict::Acknowledged => Ok(ack),
            Verdict::InvalidSignature => Err(Error::InvalidSignature),
            Verdict::AmountMismatch => Err(Error::AmountMismatch {
                expected: intent.amount,
                received: params.out_sum,
            }),
            Verdict::AlreadyFailed => Err(Error::InvalidStatusTransition(format!(
                "invoice {} has already failed",
                params.inv_id
            ))),
        }
    }

    /// Success channel. Records the redirect for audit and never marks paid.
    pub async fn handle_success(&self, query: RawPayload) -> Result<PaymentIntent> {
        let params = CallbackParams::from_form(query)?;
        let (intent, verdict) = self.reconcile(Channel::Success, &params).await?;
        match verdict {
            Verdict::InvalidSignature => Err(Error::InvalidSignature),
            Verdict::AmountMismatch => Err(Error::AmountMismatch {
                expected: intent.amount,
                received: params.out_sum,
            }),
            _ => Ok(intent),
        }
    }

    async fn reconcile(
        &self,
        channel: Channel,
        params: &CallbackParams,
    ) -> Result<(PaymentIntent, Verdict)> {
        let password = match channel {
            Channel::Result => &self.gateway.password2,
            Channel::Success => &self.gateway.password1,
        };
        let check = CallbackCheck {
            channel,
            signature_valid: params.signature_valid(password),
            amount: parse_amount(&params.out_sum),
            payload: params.raw.clone(),
            at: Utc::now(),
        };

        let outcome = deadline(
            self.storage_timeout,
            self.payments.reconcile(params.inv_id, &check),
        )
        .await;
        let (modified, verdict) = match outcome {
            // Unsigned probes learn nothing about which invoices exist.
            Err(Error::NotFound(_)) if !check.signature_valid => {
                self.record_callback(channel, Verdict::InvalidSignature, params.inv_id);
                return Err(Error::InvalidSignature);
            }
            other => other?,
        };
        self.record_callback(channel, verdict, params.inv_id);
        Ok((modified.record, verdict))
    }

    fn record_callback(&self, channel: Channel, verdict: Verdict, inv_id: InvoiceId) {
        metrics::counter!(
            observability::PAYMENT_CALLBACKS_TOTAL,
            "channel" => channel.as_str(),
            "outcome" => verdict.as_str()
        )
        .increment(1);
        match verdict {
            Verdict::InvalidSignature | Verdict::AmountMismatch | Verdict::AlreadyFailed => {
                tracing::warn!(
                    inv_id,
                    channel = channel.as_str(),
                    outcome = verdict.as_str(),
                    "payment callback rejected"
                );
            }
            _ => {
                tracing::debug!(
                    inv_id,
                    channel = channel.as_str(),
                    outcome = verdict.as_str(),
                    "payment callback"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{at, intent_for};
    use crate::model::BookingStatus;
    use crate::payment::testing::{gateway, harness};
    use crate::payment::PaymentRequest;
    use std::collections::BTreeMap;
    use ulid::Ulid;

    fn check(channel: Channel, signature_valid: bool, amount: &str) -> CallbackCheck {
        CallbackCheck {
            channel,
            signature_valid,
            amount: parse_amount(amount),
            payload: BTreeMap::from([("OutSum".to_string(), amount.to_string())]),
            at: at(21, 0),
        }
    }

    // ── CallbackCheck::apply ───────────────────────────────

    #[test]
    fn valid_result_marks_paid_once() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        assert_eq!(check(Channel::Result, true, "300.00").apply(&mut intent), Verdict::Applied);
        assert_eq!(intent.status, IntentStatus::Paid);
        assert_eq!(intent.paid_at, Some(at(21, 0)));
        assert!(intent.result_payload.is_some());

        let snapshot = intent.clone();
        assert_eq!(
            check(Channel::Result, true, "300").apply(&mut intent),
            Verdict::AlreadyApplied
        );
        assert_eq!(intent, snapshot);
    }

    #[test]
    fn bad_signature_fails_intent_but_never_paid_one() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        assert_eq!(
            check(Channel::Result, false, "300").apply(&mut intent),
            Verdict::InvalidSignature
        );
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(intent.failure_reason.as_deref(), Some("invalid signature"));

        let mut paid = intent_for(Ulid::new(), 2, "300");
        paid.status = IntentStatus::Paid;
        let snapshot = paid.clone();
        check(Channel::Result, false, "300").apply(&mut paid);
        assert_eq!(paid, snapshot);
    }

    #[test]
    fn success_on_paid_intent_records_audit_only() {
        let mut paid = intent_for(Ulid::new(), 1, "300");
        paid.status = IntentStatus::Paid;
        assert_eq!(
            check(Channel::Success, true, "300").apply(&mut paid),
            Verdict::Acknowledged
        );
        assert_eq!(paid.status, IntentStatus::Paid);
        assert!(paid.success_payload.is_some());
    }

    #[test]
    fn amount_mismatch_fails_intent() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        assert_eq!(
            check(Channel::Result, true, "299.99").apply(&mut intent),
            Verdict::AmountMismatch
        );
        assert_eq!(intent.status, IntentStatus::Failed);
        assert_eq!(intent.failure_reason.as_deref(), Some("amount mismatch"));
    }

    #[test]
    fn failed_is_terminal() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        intent.status = IntentStatus::Failed;
        assert_eq!(
            check(Channel::Result, true, "300").apply(&mut intent),
            Verdict::AlreadyFailed
        );
        assert_eq!(intent.status, IntentStatus::Failed);
    }

    #[test]
    fn success_moves_created_to_pending_only() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        assert_eq!(
            check(Channel::Success, true, "300").apply(&mut intent),
            Verdict::Acknowledged
        );
        assert_eq!(intent.status, IntentStatus::Pending);
        assert!(intent.success_payload.is_some());

        let mut failed = intent_for(Ulid::new(), 2, "300");
        failed.status = IntentStatus::Failed;
        check(Channel::Success, true, "300").apply(&mut failed);
        assert_eq!(failed.status, IntentStatus::Failed);
    }

    #[test]
    fn invalid_success_records_payload_without_status_change() {
        let mut intent = intent_for(Ulid::new(), 1, "300");
        assert_eq!(
            check(Channel::Success, false, "300").apply(&mut intent),
            Verdict::InvalidSignature
        );
        assert_eq!(intent.status, IntentStatus::Created);
        assert!(intent.success_payload.is_some());
    }

    #[test]
    fn form_keys_are_case_insensitive() {
        let raw = BTreeMap::from([
            ("outsum".to_string(), "300.00".to_string()),
            ("INVID".to_string(), "77".to_string()),
            ("signaturevalue".to_string(), "abc".to_string()),
            ("Shp_booking".to_string(), "x".to_string()),
        ]);
        let params = CallbackParams::from_form(raw).unwrap();
        assert_eq!(params.inv_id, 77);
        assert_eq!(params.out_sum, "300.00");
        assert_eq!(params.signature, "abc");
        assert_eq!(params.shp.len(), 1);
        assert!(matches!(
            CallbackParams::from_form(BTreeMap::new()),
            Err(Error::Validation(_))
        ));
    }

    // ── PaymentService callbacks ───────────────────────────

    fn signed_form(inv_id: InvoiceId, out_sum: &str, password: &str) -> RawPayload {
        let inv_text = inv_id.to_string();
        let sig = sign(&[out_sum, inv_text.as_str(), password], &BTreeMap::new());
        BTreeMap::from([
            ("OutSum".to_string(), out_sum.to_string()),
            ("InvId".to_string(), inv_text),
            ("SignatureValue".to_string(), sig.to_uppercase()),
        ])
    }

    async fn init(h: &crate::payment::testing::Harness) -> InvoiceId {
        h.payments
            .init(
                &h.renter,
                PaymentRequest {
                    booking_id: h.booking.id,
                    out_sum: "300".into(),
                    description: "Rehearsal".into(),
                    shp_params: BTreeMap::new(),
                },
            )
            .await
            .unwrap()
            .inv_id
    }

    #[tokio::test]
    async fn result_callback_settles_booking_once() {
        let h = harness("result_settles.wal").await;
        let inv_id = init(&h).await;
        let mut owner_inbox = h.hub.subscribe(h.owner.user_id);
        let form = signed_form(inv_id, "300.00", &gateway().password2);

        let ack = h.payments.handle_result(form.clone()).await.unwrap();
        assert_eq!(ack.body(), format!("OK{inv_id}"));
        let booking = h.engine.get_booking(&h.booking.id).await.unwrap();
        assert_eq!(booking.payment_status, BookingPaymentStatus::Paid);
        assert_eq!(booking.status, BookingStatus::Pending);
        assert!(matches!(
            owner_inbox.recv().await.unwrap(),
            Notification::PaymentReceived { .. }
        ));

        // Replays acknowledge without a second transition.
        let appends = h.engine.wal_appends_since_compact().await;
        let again = h.payments.handle_result(form).await.unwrap();
        assert_eq!(again, ack);
        assert_eq!(h.engine.wal_appends_since_compact().await, appends);
        assert!(owner_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn result_with_wrong_password_is_rejected_and_recorded() {
        let h = harness("result_bad_sig.wal").await;
        let inv_id = init(&h).await;
        // Signed with the success-channel password.
        let form = signed_form(inv_id, "300", &gateway().password1);

        let err = h.payments.handle_result(form).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
        let intent = h.engine.get_intent(inv_id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Failed);
        let booking = h.engine.get_booking(&h.booking.id).await.unwrap();
        assert_eq!(booking.payment_status, BookingPaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn result_amount_mismatch() {
        let h = harness("result_mismatch.wal").await;
        let inv_id = init(&h).await;
        let form = signed_form(inv_id, "299.99", &gateway().password2);
        let err = h.payments.handle_result(form).await.unwrap_err();
        assert!(matches!(err, Error::AmountMismatch { .. }));
        assert_eq!(
            h.engine.get_intent(inv_id).await.unwrap().failure_reason.as_deref(),
            Some("amount mismatch")
        );
    }

    #[tokio::test]
    async fn unknown_invoice() {
        let h = harness("result_unknown.wal").await;
        let signed = signed_form(123, "300", &gateway().password2);
        assert!(matches!(
            h.payments.handle_result(signed).await,
            Err(Error::NotFound(_))
        ));
        let forged = signed_form(123, "300", "guess");
        assert!(matches!(
            h.payments.handle_result(forged).await,
            Err(Error::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn success_redirect_never_marks_paid() {
        let h = harness("success_redirect.wal").await;
        let inv_id = init(&h).await;
        let intent = h
            .payments
            .handle_success(signed_form(inv_id, "300", &gateway().password1))
            .await
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        let booking = h.engine.get_booking(&h.booking.id).await.unwrap();
        assert_eq!(booking.payment_status, BookingPaymentStatus::Unpaid);

        let err = h
            .payments
            .handle_success(signed_form(inv_id, "300", &gateway().password2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));
    }

    #[tokio::test]
    async fn concurrent_result_replays_apply_once() {
        let h = std::sync::Arc::new(harness("result_concurrent.wal").await);
        let inv_id = init(&h).await;
        let form = signed_form(inv_id, "300", &gateway().password2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            let form = form.clone();
            handles.push(tokio::spawn(async move { h.payments.handle_result(form).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let intent = h.engine.get_intent(inv_id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Paid);
    }
}
