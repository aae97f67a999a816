//! Postgres backend. Overlap exclusion lives in the `bookings_no_overlap`
//! constraint; read-modify-writes lock their row with `FOR UPDATE` under a
//! transaction-local `lock_timeout`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use ulid::Ulid;

use crate::booking::BookingChange;
use crate::error::{Error, Result};
use crate::model::{Booking, BookingId, InvoiceId, PaymentIntent, RawPayload, RoomId, Span};
use crate::payment::{CallbackCheck, Verdict};

use super::{BookingRepository, Modified, PaymentRepository};

/// Name of the exclusion constraint in `migrations/0001_init.sql`.
pub const BOOKING_OVERLAP_CONSTRAINT: &str = "bookings_no_overlap";

const EXCLUSION_VIOLATION: &str = "23P01";
const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";

const BOOKING_COLUMNS: &str = "id, room_id, studio_id, renter_id, start_time, end_time, \
     total_price, deposit_amount, status, payment_status, notes, cancellation_reason, \
     created_at, updated_at";

const INTENT_COLUMNS: &str = "inv_id, booking_id, amount, description, shp_params, status, \
     signature, failure_reason, result_payload, success_payload, paid_at, created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    /// Connect and apply pending migrations.
    pub async fn connect(url: &str, max_connections: u32, lock_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(storage)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Storage(format!("migration failed: {e}")))?;
        Ok(Self::new(pool, lock_timeout))
    }

    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        // SET cannot take bind parameters; the value is an integer.
        let stmt = format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis());
        sqlx::query(&stmt).execute(&mut *tx).await.map_err(storage)?;
        Ok(tx)
    }
}

fn storage(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e
        && db.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
    {
        return Error::LockUnavailable;
    }
    Error::Storage(e.to_string())
}

fn overlap_or_storage(e: sqlx::Error, room_id: RoomId) -> Error {
    if let sqlx::Error::Database(db) = &e
        && db.code().as_deref() == Some(EXCLUSION_VIOLATION)
        && db.constraint() == Some(BOOKING_OVERLAP_CONSTRAINT)
    {
        return Error::Overbooking { room_id };
    }
    storage(e)
}

fn instant(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Validation(format!("timestamp out of range: {ms}")))
}

fn ulid(column: &str, text: &str) -> Result<Ulid> {
    text.parse()
        .map_err(|_| Error::Storage(format!("corrupt {column}: {text:?}")))
}

fn text_enum<T: std::str::FromStr<Err = String>>(column: &str, text: &str) -> Result<T> {
    text.parse()
        .map_err(|e| Error::Storage(format!("corrupt {column}: {e:?}")))
}

#[derive(Debug, FromRow)]
struct BookingRow {
    id: String,
    room_id: String,
    studio_id: String,
    renter_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    total_price: Decimal,
    deposit_amount: Decimal,
    status: String,
    payment_status: String,
    notes: Option<String>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = Error;

    fn try_from(row: BookingRow) -> Result<Self> {
        Ok(Booking {
            id: ulid("bookings.id", &row.id)?,
            room_id: ulid("bookings.room_id", &row.room_id)?,
            studio_id: ulid("bookings.studio_id", &row.studio_id)?,
            renter_id: ulid("bookings.renter_id", &row.renter_id)?,
            start: row.start_time,
            end: row.end_time,
            total_price: row.total_price,
            deposit_amount: row.deposit_amount,
            status: text_enum("bookings.status", &row.status)?,
            payment_status: text_enum("bookings.payment_status", &row.payment_status)?,
            notes: row.notes,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IntentRow {
    inv_id: i64,
    booking_id: String,
    amount: Decimal,
    description: String,
    shp_params: Json<RawPayload>,
    status: String,
    signature: String,
    failure_reason: Option<String>,
    result_payload: Option<Json<RawPayload>>,
    success_payload: Option<Json<RawPayload>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = Error;

    fn try_from(row: IntentRow) -> Result<Self> {
        Ok(PaymentIntent {
            inv_id: row.inv_id,
            booking_id: ulid("payment_intents.booking_id", &row.booking_id)?,
            amount: row.amount,
            description: row.description,
            shp_params: row.shp_params.0,
            status: text_enum("payment_intents.status", &row.status)?,
            signature: row.signature,
            failure_reason: row.failure_reason,
            result_payload: row.result_payload.map(|j| j.0),
            success_payload: row.success_payload.map(|j| j.0),
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl BookingRepository for PgStore {
    async fn insert(&self, booking: Booking) -> Result<Booking> {
        sqlx::query(
            "INSERT INTO bookings (id, room_id, studio_id, renter_id, start_time, end_time, \
             total_price, deposit_amount, status, payment_status, notes, cancellation_reason, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(booking.id.to_string())
        .bind(booking.room_id.to_string())
        .bind(booking.studio_id.to_string())
        .bind(booking.renter_id.to_string())
        .bind(booking.start)
        .bind(booking.end)
        .bind(booking.total_price)
        .bind(booking.deposit_amount)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(booking.notes.as_deref())
        .bind(booking.cancellation_reason.as_deref())
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| overlap_or_storage(e, booking.room_id))?;
        Ok(booking)
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(Booking::try_from).transpose()
    }

    async fn busy_spans(&self, room: RoomId, window: Span) -> Result<Vec<Span>> {
        let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT start_time, end_time FROM bookings \
             WHERE room_id = $1 AND status <> 'cancelled' \
               AND start_time < $3 AND end_time > $2 \
             ORDER BY start_time",
        )
        .bind(room.to_string())
        .bind(instant(window.start)?)
        .bind(instant(window.end)?)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(|(start, end)| Span::from_instants(start, end))
            .collect())
    }

    async fn modify(&self, id: BookingId, change: &BookingChange) -> Result<Modified<Booking>> {
        let mut tx = self.begin_locked().await?;
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE");
        let row: Option<BookingRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        let current = row
            .map(Booking::try_from)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("booking {id}")))?;

        let mut next = current.clone();
        change.apply(&mut next)?;
        if next == current {
            return Ok(Modified {
                record: current,
                changed: false,
            });
        }

        sqlx::query(
            "UPDATE bookings SET status = $2, payment_status = $3, deposit_amount = $4, \
             cancellation_reason = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(next.status.as_str())
        .bind(next.payment_status.as_str())
        .bind(next.deposit_amount)
        .bind(next.cancellation_reason.as_deref())
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| overlap_or_storage(e, next.room_id))?;
        tx.commit().await.map_err(storage)?;
        Ok(Modified {
            record: next,
            changed: true,
        })
    }

    async fn ping(&self) -> Result<&'static str> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok("postgres")
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn insert_intent(&self, intent: PaymentIntent) -> Result<PaymentIntent> {
        sqlx::query(
            "INSERT INTO payment_intents (inv_id, booking_id, amount, description, shp_params, \
             status, signature, failure_reason, result_payload, success_payload, paid_at, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(intent.inv_id)
        .bind(intent.booking_id.to_string())
        .bind(intent.amount)
        .bind(&intent.description)
        .bind(Json(&intent.shp_params))
        .bind(intent.status.as_str())
        .bind(&intent.signature)
        .bind(intent.failure_reason.as_deref())
        .bind(intent.result_payload.as_ref().map(Json))
        .bind(intent.success_payload.as_ref().map(Json))
        .bind(intent.paid_at)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e
                && db.code().as_deref() == Some(UNIQUE_VIOLATION)
            {
                return Error::Storage(format!("invoice {} already exists", intent.inv_id));
            }
            storage(e)
        })?;
        Ok(intent)
    }

    async fn get_intent(&self, inv_id: InvoiceId) -> Result<Option<PaymentIntent>> {
        let sql = format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE inv_id = $1");
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(inv_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(PaymentIntent::try_from).transpose()
    }

    async fn reconcile(
        &self,
        inv_id: InvoiceId,
        check: &CallbackCheck,
    ) -> Result<(Modified<PaymentIntent>, Verdict)> {
        let mut tx = self.begin_locked().await?;
        let sql =
            format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE inv_id = $1 FOR UPDATE");
        let row: Option<IntentRow> = sqlx::query_as(&sql)
            .bind(inv_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        let current = row
            .map(PaymentIntent::try_from)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("invoice {inv_id}")))?;

        let mut next = current.clone();
        let verdict = check.apply(&mut next);
        if next == current {
            return Ok((
                Modified {
                    record: current,
                    changed: false,
                },
                verdict,
            ));
        }

        sqlx::query(
            "UPDATE payment_intents SET status = $2, failure_reason = $3, result_payload = $4, \
             success_payload = $5, paid_at = $6, updated_at = $7 WHERE inv_id = $1",
        )
        .bind(inv_id)
        .bind(next.status.as_str())
        .bind(next.failure_reason.as_deref())
        .bind(next.result_payload.as_ref().map(Json))
        .bind(next.success_payload.as_ref().map(Json))
        .bind(next.paid_at)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok((
            Modified {
                record: next,
                changed: true,
            },
            verdict,
        ))
    }
}
