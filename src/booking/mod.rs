//! Reservation manager: booking creation, the status state machine and the
//! room availability view.

mod transition;

pub use transition::{BookingChange, BookingCommand, Standing, standing};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use ulid::Ulid;

use crate::availability::{busy_within, free_slots};
use crate::catalog::{Catalog, OpeningHours, Room, Studio};
use crate::error::{Error, Result};
use crate::limits::{
    MAX_BOOKING_DURATION_MS, MAX_NOTES_LEN, MONEY_INTEGER_DIGITS, MONEY_SCALE,
};
use crate::model::{
    Booking, BookingId, BookingPaymentStatus, BookingStatus, RoomId, Span, StudioId, UserId,
};
use crate::notify::{Notification, Notifier};
use crate::observability;
use crate::store::{BookingRepository, deadline};

const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Renter,
    StudioOwner,
    StudioManager,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "renter" => Ok(Role::Renter),
            "studio_owner" => Ok(Role::StudioOwner),
            "studio_manager" => Ok(Role::StudioManager),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The authenticated caller, as asserted by the upstream gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub room_id: RoomId,
    pub studio_id: StudioId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomAvailability {
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub working_hours: Option<OpeningHours>,
    pub booked_slots: Vec<SlotView>,
    pub free_slots: Vec<SlotView>,
}

/// `duration_hours × hourly_rate`, rounded half away from zero to cents.
pub fn total_price(
    hourly_rate: Decimal,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Decimal> {
    let ms = Decimal::from((end - start).num_milliseconds());
    let total = hourly_rate
        .checked_mul(ms)
        .and_then(|v| v.checked_div(Decimal::from(MS_PER_HOUR)))
        .map(|v| {
            let mut cents =
                v.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
            cents.rescale(MONEY_SCALE);
            cents
        })
        .ok_or_else(|| Error::Validation("price out of range".into()))?;
    check_money(total, "total price")
}

/// Reject amounts that storage would round or overflow: more than two
/// decimal places, or ten or more integer digits.
pub fn check_money(amount: Decimal, what: &str) -> Result<Decimal> {
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(Error::Validation(format!(
            "{what} must have at most {MONEY_SCALE} decimal places"
        )));
    }
    if amount.abs() >= Decimal::from(10_i64.pow(MONEY_INTEGER_DIGITS)) {
        return Err(Error::Validation(format!("{what} is out of range")));
    }
    Ok(amount)
}

pub struct BookingService {
    bookings: Arc<dyn BookingRepository>,
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    storage_timeout: Duration,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            bookings,
            catalog,
            notifier,
            storage_timeout,
        }
    }

    pub async fn create(&self, actor: &Actor, req: NewBooking) -> Result<Booking> {
        if actor.role != Role::Renter {
            return Err(Error::Forbidden("only renters can create bookings".into()));
        }
        let now = Utc::now();
        if req.end <= req.start {
            return Err(Error::Validation("end_time must be after start_time".into()));
        }
        if req.start < now {
            return Err(Error::Validation("start_time is in the past".into()));
        }
        if (req.end - req.start).num_milliseconds() > MAX_BOOKING_DURATION_MS {
            return Err(Error::Validation("booking is too long".into()));
        }
        let notes = req.notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        if notes.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LEN) {
            return Err(Error::Validation(format!(
                "notes must be at most {MAX_NOTES_LEN} characters"
            )));
        }

        let room = self.room(req.room_id).await?;
        if room.studio_id != req.studio_id {
            return Err(Error::Validation(format!(
                "room {} does not belong to studio {}",
                room.id, req.studio_id
            )));
        }
        let price = total_price(room.hourly_rate, req.start, req.end)?;

        let span = Span::from_instants(req.start, req.end);
        let busy = deadline(self.storage_timeout, self.bookings.busy_spans(room.id, span)).await?;
        if !busy.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "layer" => "early")
                .increment(1);
            return Err(Error::Overbooking { room_id: room.id });
        }

        let booking = Booking {
            id: Ulid::new(),
            room_id: room.id,
            studio_id: room.studio_id,
            renter_id: actor.user_id,
            start: req.start,
            end: req.end,
            total_price: price,
            deposit_amount: Decimal::ZERO,
            status: BookingStatus::Pending,
            payment_status: BookingPaymentStatus::Unpaid,
            notes,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };
        let booking = match deadline(self.storage_timeout, self.bookings.insert(booking)).await {
            Err(e @ Error::Overbooking { .. }) => {
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "layer" => "storage")
                    .increment(1);
                return Err(e);
            }
            other => other?,
        };

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking_id = %booking.id,
            room_id = %booking.room_id,
            renter_id = %booking.renter_id,
            total_price = %booking.total_price,
            "booking created"
        );
        if let Some(studio) = self.studio(booking.studio_id).await {
            self.notifier.notify(
                studio.owner_id,
                Notification::BookingRequested {
                    booking_id: booking.id,
                },
            );
        }
        Ok(booking)
    }

    /// Readable by the renter and the studio staff.
    pub async fn get(&self, actor: &Actor, id: BookingId) -> Result<Booking> {
        let booking = self.booking(id).await?;
        let studio = self.studio(booking.studio_id).await;
        match standing(actor, &booking, studio.as_ref()) {
            Standing::Renter | Standing::StudioStaff => Ok(booking),
            Standing::Unrelated | Standing::System => {
                Err(Error::Forbidden("not a party to this booking".into()))
            }
        }
    }

    pub async fn confirm(&self, actor: &Actor, id: BookingId) -> Result<Booking> {
        self.transition(actor, id, BookingCommand::Confirm).await
    }

    pub async fn cancel(&self, actor: &Actor, id: BookingId, reason: &str) -> Result<Booking> {
        let command = BookingCommand::cancel(reason)?;
        self.transition(actor, id, command).await
    }

    pub async fn complete(&self, actor: &Actor, id: BookingId) -> Result<Booking> {
        self.transition(actor, id, BookingCommand::Complete).await
    }

    /// Deposits need the same authority as confirm, since a positive deposit
    /// on a pending booking confirms it.
    pub async fn set_deposit(
        &self,
        actor: &Actor,
        id: BookingId,
        amount: Decimal,
    ) -> Result<Booking> {
        let command = BookingCommand::deposit(amount)?;
        self.transition(actor, id, command).await
    }

    /// Record a payment taken outside the gateway.
    pub async fn mark_paid(&self, actor: &Actor, id: BookingId) -> Result<Booking> {
        self.transition(actor, id, BookingCommand::MarkPaid).await
    }

    /// Internal: set the booking's payment status from the payment side.
    pub async fn sync_payment_status(
        &self,
        id: BookingId,
        status: BookingPaymentStatus,
    ) -> Result<Booking> {
        let change = BookingChange::new(BookingCommand::SyncPayment(status), Standing::System);
        let modified = deadline(self.storage_timeout, self.bookings.modify(id, &change)).await?;
        if modified.changed {
            tracing::info!(
                booking_id = %id,
                payment_status = %status,
                "booking payment status synced"
            );
        }
        Ok(modified.record)
    }

    pub async fn availability(&self, room_id: RoomId, date: NaiveDate) -> Result<RoomAvailability> {
        let room = self.room(room_id).await?;
        let schedule = &room.schedule;
        let render = |spans: Vec<Span>| -> Vec<SlotView> {
            spans
                .into_iter()
                .map(|s| SlotView {
                    start: schedule.local_hhmm(s.start),
                    end: schedule.local_hhmm(s.end),
                })
                .collect()
        };

        let Some((hours, window)) = schedule.window_on(date) else {
            return Ok(RoomAvailability {
                room_id,
                date,
                working_hours: None,
                booked_slots: Vec::new(),
                free_slots: Vec::new(),
            });
        };
        let busy = if window.is_empty() {
            Vec::new()
        } else {
            deadline(self.storage_timeout, self.bookings.busy_spans(room_id, window)).await?
        };

        Ok(RoomAvailability {
            room_id,
            date,
            working_hours: Some(hours),
            booked_slots: render(busy_within(window, &busy)),
            free_slots: render(free_slots(window, &busy)),
        })
    }

    async fn transition(
        &self,
        actor: &Actor,
        id: BookingId,
        command: BookingCommand,
    ) -> Result<Booking> {
        let booking = self.booking(id).await?;
        let before = booking.status;
        let studio = self.studio(booking.studio_id).await;
        let standing = standing(actor, &booking, studio.as_ref());
        let change = BookingChange::new(command, standing);
        change.authorize()?;

        let modified = deadline(self.storage_timeout, self.bookings.modify(id, &change)).await?;
        let booking = modified.record;
        if modified.changed {
            let label = change.command.label();
            metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "command" => label)
                .increment(1);
            tracing::info!(
                booking_id = %booking.id,
                command = label,
                status = %booking.status,
                actor = %actor.user_id,
                "booking updated"
            );
            self.notify_counterparty(&booking, before, standing, studio.as_ref(), &change.command);
        }
        Ok(booking)
    }

    fn notify_counterparty(
        &self,
        booking: &Booking,
        before: BookingStatus,
        standing: Standing,
        studio: Option<&Studio>,
        command: &BookingCommand,
    ) {
        let notification = match command {
            BookingCommand::Cancel { reason } => Notification::BookingCancelled {
                booking_id: booking.id,
                reason: reason.clone(),
            },
            BookingCommand::Complete => Notification::BookingCompleted {
                booking_id: booking.id,
            },
            BookingCommand::Confirm | BookingCommand::SetDeposit { .. }
                if before == BookingStatus::Pending && booking.status == BookingStatus::Confirmed =>
            {
                Notification::BookingConfirmed {
                    booking_id: booking.id,
                }
            }
            _ => return,
        };
        let recipient = match standing {
            Standing::Renter => studio.map(|s| s.owner_id),
            _ => Some(booking.renter_id),
        };
        if let Some(recipient) = recipient {
            self.notifier.notify(recipient, notification);
        }
    }

    /// Notify the studio owner of a settled gateway payment.
    pub async fn notify_payment(&self, booking_id: BookingId, notification: Notification) {
        let owner = match self.booking(booking_id).await {
            Ok(b) => self.studio(b.studio_id).await.map(|s| s.owner_id),
            Err(e) => {
                tracing::warn!(%booking_id, error = %e, "payment notification skipped");
                None
            }
        };
        if let Some(owner) = owner {
            self.notifier.notify(owner, notification);
        }
    }

    pub async fn storage_status(&self) -> Result<&'static str> {
        deadline(self.storage_timeout, self.bookings.ping()).await
    }

    async fn booking(&self, id: BookingId) -> Result<Booking> {
        deadline(self.storage_timeout, self.bookings.get(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("booking {id}")))
    }

    async fn room(&self, id: RoomId) -> Result<Room> {
        deadline(self.storage_timeout, self.catalog.room(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("room {id}")))
    }

    /// Catalog failures degrade to "no studio" and are logged.
    async fn studio(&self, id: StudioId) -> Option<Studio> {
        match deadline(self.storage_timeout, self.catalog.studio(id)).await {
            Ok(studio) => studio,
            Err(e) => {
                tracing::warn!(studio_id = %id, error = %e, "studio lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StaticCatalog, WorkingHoursSchedule};
    use crate::engine::{Engine, EngineConfig};
    use crate::notify::NotifyHub;
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};

    struct Fixture {
        service: BookingService,
        hub: Arc<NotifyHub>,
        room: Room,
        owner: Actor,
        renter: Actor,
    }

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("studiobook_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn fixture(name: &str) -> Fixture {
        let engine = Arc::new(Engine::new(test_wal_path(name), EngineConfig::default()).unwrap());
        let owner = Actor {
            user_id: Ulid::new(),
            role: Role::StudioOwner,
        };
        let renter = Actor {
            user_id: Ulid::new(),
            role: Role::Renter,
        };
        let studio = Studio {
            id: Ulid::new(),
            owner_id: owner.user_id,
            manager_ids: vec![],
        };
        let hours = OpeningHours {
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        };
        let room = Room {
            id: Ulid::new(),
            studio_id: studio.id,
            hourly_rate: Decimal::new(150000, 2),
            schedule: WorkingHoursSchedule {
                monday: Some(hours),
                ..Default::default()
            },
        };
        let catalog = StaticCatalog::new();
        catalog.insert_studio(studio);
        catalog.insert_room(room.clone());
        let hub = Arc::new(NotifyHub::new());
        let service = BookingService::new(
            engine,
            Arc::new(catalog),
            hub.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            service,
            hub,
            room,
            owner,
            renter,
        }
    }

    /// A Monday far enough ahead to never be in the past.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2031, 3, 10).unwrap()
    }

    fn on_monday(hour: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&monday().and_hms_opt(hour, 0, 0).unwrap())
    }

    fn request(f: &Fixture, from: u32, to: u32) -> NewBooking {
        NewBooking {
            room_id: f.room.id,
            studio_id: f.room.studio_id,
            start: on_monday(from),
            end: on_monday(to),
            notes: Some("band rehearsal".into()),
        }
    }

    #[test]
    fn price_rounds_half_up() {
        let start = on_monday(10);
        // 20 minutes at 10.01/h = 3.33666.. -> 3.34
        assert_eq!(
            total_price(Decimal::new(1001, 2), start, start + ChronoDuration::minutes(20)).unwrap(),
            Decimal::new(334, 2)
        );
        // 30 minutes at 0.05/h = 0.025 -> 0.03
        assert_eq!(
            total_price(Decimal::new(5, 2), start, start + ChronoDuration::minutes(30)).unwrap(),
            Decimal::new(3, 2)
        );
        // 20 minutes at 1500/h is exactly 500.
        assert_eq!(
            total_price(Decimal::new(1500, 0), start, start + ChronoDuration::minutes(20)).unwrap(),
            Decimal::new(500, 0)
        );
    }

    #[test]
    fn price_beyond_money_range_is_validation() {
        let start = on_monday(8);
        let err = total_price(
            Decimal::new(1_000_000_000, 0),
            start,
            start + ChronoDuration::hours(20),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn create_prices_and_notifies_owner() {
        let f = fixture("create_prices.wal");
        let mut inbox = f.hub.subscribe(f.owner.user_id);

        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
        assert_eq!(b.status, BookingStatus::Pending);
        assert_eq!(b.payment_status, BookingPaymentStatus::Unpaid);
        assert_eq!(b.total_price, Decimal::new(300000, 2));
        assert_eq!(
            inbox.recv().await.unwrap(),
            Notification::BookingRequested { booking_id: b.id }
        );
    }

    #[tokio::test]
    async fn create_validates_before_storage() {
        let f = fixture("create_validation.wal");
        let err = f.service.create(&f.renter, request(&f, 12, 10)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut past = request(&f, 10, 12);
        past.start = Utc::now() - ChronoDuration::hours(2);
        past.end = Utc::now() - ChronoDuration::hours(1);
        let err = f.service.create(&f.renter, past).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut wrong_studio = request(&f, 10, 12);
        wrong_studio.studio_id = Ulid::new();
        let err = f.service.create(&f.renter, wrong_studio).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = f.service.create(&f.owner, request(&f, 10, 12)).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn create_unknown_room_not_found() {
        let f = fixture("create_unknown_room.wal");
        let mut req = request(&f, 10, 12);
        req.room_id = Ulid::new();
        let err = f.service.create(&f.renter, req).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn overlapping_create_is_overbooking() {
        let f = fixture("create_overlap.wal");
        f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
        let err = f.service.create(&f.renter, request(&f, 11, 13)).await.unwrap_err();
        assert!(matches!(err, Error::Overbooking { .. }));
        f.service.create(&f.renter, request(&f, 12, 13)).await.unwrap();
    }

    #[tokio::test]
    async fn owner_confirms_renter_cannot() {
        let f = fixture("confirm_authority.wal");
        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();

        let err = f.service.confirm(&f.renter, b.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let mut inbox = f.hub.subscribe(f.renter.user_id);
        let confirmed = f.service.confirm(&f.owner, b.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(
            inbox.recv().await.unwrap(),
            Notification::BookingConfirmed { booking_id: b.id }
        );
    }

    #[tokio::test]
    async fn short_cancel_reason_changes_nothing() {
        let f = fixture("cancel_short.wal");
        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
        let err = f.service.cancel(&f.renter, b.id, "no").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let unchanged = f.service.get(&f.renter, b.id).await.unwrap();
        assert_eq!(unchanged.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_frees_slot_and_notifies_owner() {
        let f = fixture("cancel_frees.wal");
        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
        let mut inbox = f.hub.subscribe(f.owner.user_id);

        let cancelled = f
            .service
            .cancel(&f.renter, b.id, "the drummer is sick")
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert!(matches!(
            inbox.recv().await.unwrap(),
            Notification::BookingCancelled { .. }
        ));
        f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
    }

    #[tokio::test]
    async fn strangers_cannot_read() {
        let f = fixture("get_forbidden.wal");
        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();
        let stranger = Actor {
            user_id: Ulid::new(),
            role: Role::Renter,
        };
        assert!(matches!(
            f.service.get(&stranger, b.id).await,
            Err(Error::Forbidden(_))
        ));
        assert!(f.service.get(&f.owner, b.id).await.is_ok());
        assert!(matches!(
            f.service.get(&f.owner, Ulid::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deposit_confirms_then_mark_paid() {
        let f = fixture("deposit_mark_paid.wal");
        let b = f.service.create(&f.renter, request(&f, 10, 12)).await.unwrap();

        let err = f
            .service
            .set_deposit(&f.renter, b.id, Decimal::new(100, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let b = f
            .service
            .set_deposit(&f.owner, b.id, Decimal::new(100, 0))
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);

        let b = f.service.mark_paid(&f.owner, b.id).await.unwrap();
        assert_eq!(b.payment_status, BookingPaymentStatus::Paid);
        let b = f.service.complete(&f.owner, b.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::Completed);
    }

    #[tokio::test]
    async fn availability_splits_working_hours() {
        let f = fixture("availability.wal");
        f.service.create(&f.renter, request(&f, 12, 14)).await.unwrap();

        let view = f.service.availability(f.room.id, monday()).await.unwrap();
        let slot = |s: &str, e: &str| SlotView {
            start: s.into(),
            end: e.into(),
        };
        assert_eq!(view.booked_slots, vec![slot("12:00", "14:00")]);
        assert_eq!(
            view.free_slots,
            vec![slot("09:00", "12:00"), slot("14:00", "18:00")]
        );

        let tuesday = monday().succ_opt().unwrap();
        let closed = f.service.availability(f.room.id, tuesday).await.unwrap();
        assert!(closed.working_hours.is_none());
        assert!(closed.free_slots.is_empty());
    }
}
