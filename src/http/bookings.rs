use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::booking::{Actor, NewBooking, RoomAvailability};
use crate::error::Result;
use crate::model::{Booking, BookingId, RoomId, StudioId};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    date: NaiveDate,
}

pub async fn availability(
    State(state): State<AppState>,
    room_id: Result<Path<RoomId>, PathRejection>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> Result<Json<RoomAvailability>> {
    let Path(room_id) = room_id?;
    let Query(query) = query?;
    Ok(Json(state.bookings.availability(room_id, query.date).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    room_id: RoomId,
    studio_id: StudioId,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    notes: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let Json(body) = body?;
    let booking = state
        .bookings
        .create(
            &actor,
            NewBooking {
                room_id: body.room_id,
                studio_id: body.studio_id,
                start: body.start_time,
                end: body.end_time,
                notes: body.notes,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "booking": { "id": booking.id, "status": booking.status } })),
    ))
}

fn envelope(booking: Booking) -> Json<Value> {
    Json(json!({ "booking": booking }))
}

pub async fn show(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    Ok(envelope(state.bookings.get(&actor, id).await?))
}

pub async fn confirm(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    Ok(envelope(state.bookings.confirm(&actor, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    reason: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
    body: Result<Json<CancelBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    let Json(body) = body?;
    Ok(envelope(state.bookings.cancel(&actor, id, &body.reason).await?))
}

pub async fn complete(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    Ok(envelope(state.bookings.complete(&actor, id).await?))
}

pub async fn mark_paid(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    Ok(envelope(state.bookings.mark_paid(&actor, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DepositBody {
    deposit_amount: Decimal,
}

pub async fn deposit(
    State(state): State<AppState>,
    actor: Actor,
    id: Result<Path<BookingId>, PathRejection>,
    body: Result<Json<DepositBody>, JsonRejection>,
) -> Result<Json<Value>> {
    let Path(id) = id?;
    let Json(body) = body?;
    Ok(envelope(
        state.bookings.set_deposit(&actor, id, body.deposit_amount).await?,
    ))
}
