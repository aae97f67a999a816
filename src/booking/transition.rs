use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::catalog::Studio;
use crate::error::{Error, Result};
use crate::limits::{MAX_CANCEL_REASON_LEN, MIN_CANCEL_REASON_LEN};
use crate::model::{Booking, BookingPaymentStatus, BookingStatus};

use super::{Actor, Role, check_money};

/// How an actor relates to one booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Renter,
    StudioStaff,
    Unrelated,
    /// Internal callers such as the payment reconciler.
    System,
}

impl Standing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Standing::Renter => "renter",
            Standing::StudioStaff => "studio staff",
            Standing::Unrelated => "unrelated user",
            Standing::System => "system",
        }
    }
}

/// Resolve an actor against a booking. `studio` is the booking's studio, if
/// the catalog still knows it.
pub fn standing(actor: &Actor, booking: &Booking, studio: Option<&Studio>) -> Standing {
    let staff = match (actor.role, studio) {
        (Role::StudioOwner, Some(s)) => s.owner_id == actor.user_id,
        (Role::StudioManager, Some(s)) => s.manager_ids.contains(&actor.user_id),
        (Role::Renter, _) | (_, None) => false,
    };
    if staff && studio.is_some_and(|s| s.id == booking.studio_id) {
        Standing::StudioStaff
    } else if booking.renter_id == actor.user_id {
        Standing::Renter
    } else {
        Standing::Unrelated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingCommand {
    Confirm,
    Cancel { reason: String },
    Complete,
    SetDeposit { amount: Decimal },
    MarkPaid,
    SyncPayment(BookingPaymentStatus),
}

impl BookingCommand {
    /// Trims `reason` and checks its length.
    pub fn cancel(reason: &str) -> Result<Self> {
        let reason = reason.trim();
        let len = reason.chars().count();
        if len < MIN_CANCEL_REASON_LEN {
            return Err(Error::Validation(format!(
                "cancellation reason must be at least {MIN_CANCEL_REASON_LEN} characters"
            )));
        }
        if len > MAX_CANCEL_REASON_LEN {
            return Err(Error::Validation(format!(
                "cancellation reason must be at most {MAX_CANCEL_REASON_LEN} characters"
            )));
        }
        Ok(BookingCommand::Cancel {
            reason: reason.to_string(),
        })
    }

    pub fn deposit(amount: Decimal) -> Result<Self> {
        if amount < Decimal::ZERO {
            return Err(Error::Validation("deposit amount cannot be negative".into()));
        }
        let amount = check_money(amount, "deposit amount")?;
        Ok(BookingCommand::SetDeposit { amount })
    }

    pub fn label(&self) -> &'static str {
        match self {
            BookingCommand::Confirm => "confirm",
            BookingCommand::Cancel { .. } => "cancel",
            BookingCommand::Complete => "complete",
            BookingCommand::SetDeposit { .. } => "set_deposit",
            BookingCommand::MarkPaid => "mark_paid",
            BookingCommand::SyncPayment(_) => "sync_payment",
        }
    }
}

/// One requested transition, applied inside the repository's lock.
#[derive(Debug, Clone)]
pub struct BookingChange {
    pub command: BookingCommand,
    pub standing: Standing,
    pub at: DateTime<Utc>,
}

impl BookingChange {
    pub fn new(command: BookingCommand, standing: Standing) -> Self {
        Self {
            command,
            standing,
            at: Utc::now(),
        }
    }

    pub fn authorize(&self) -> Result<()> {
        use BookingCommand as C;
        use Standing as A;

        let allowed = match (&self.command, self.standing) {
            (C::SyncPayment(_), A::System) => true,
            (C::SyncPayment(_), _) => false,
            (C::Cancel { .. }, A::Renter | A::StudioStaff) => true,
            (C::Confirm | C::Complete | C::SetDeposit { .. } | C::MarkPaid, A::StudioStaff) => {
                true
            }
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "{} may not {} this booking",
                self.standing.as_str(),
                self.command.label()
            )))
        }
    }

    /// Check the transition against `booking`'s current state and edit it in
    /// place. On error the booking is left as it was.
    pub fn apply(&self, booking: &mut Booking) -> Result<()> {
        use BookingCommand as C;
        use BookingStatus as S;

        self.authorize()?;
        let mut next = booking.clone();
        match (&self.command, booking.status) {
            (C::Confirm, S::Pending) => next.status = S::Confirmed,
            (C::Cancel { reason }, S::Pending | S::Confirmed) => {
                next.status = S::Cancelled;
                next.cancellation_reason = Some(reason.clone());
            }
            (C::Complete, S::Confirmed) => next.status = S::Completed,
            (C::SetDeposit { amount }, S::Pending | S::Confirmed) => {
                if *amount > booking.total_price {
                    return Err(Error::Validation(format!(
                        "deposit {amount} exceeds total price {}",
                        booking.total_price
                    )));
                }
                next.deposit_amount = *amount;
                if booking.status == S::Pending && *amount > Decimal::ZERO {
                    next.status = S::Confirmed;
                }
            }
            (C::MarkPaid, S::Pending | S::Confirmed | S::Completed) => {
                next.payment_status = BookingPaymentStatus::Paid;
            }
            (C::SyncPayment(status), _) => next.payment_status = *status,
            (command, status) => {
                return Err(Error::InvalidStatusTransition(format!(
                    "cannot {} a {status} booking",
                    command.label()
                )));
            }
        }

        if next != *booking {
            next.updated_at = self.at;
            *booking = next;
        }
        Ok(())
    }
}
