use std::collections::BTreeMap;

use axum::extract::rejection::{FormRejection, JsonRejection, QueryRejection};
use axum::extract::{Form, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::booking::Actor;
use crate::error::{Error, Result};
use crate::model::{BookingId, RawPayload};
use crate::payment::{PaymentInit, PaymentRequest};

use super::AppState;

/// `out_sum` arrives as either a JSON string or a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountText {
    Text(String),
    Number(serde_json::Number),
}

impl AmountText {
    fn into_text(self) -> String {
        match self {
            AmountText::Text(s) => s,
            AmountText::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitBody {
    booking_id: BookingId,
    out_sum: AmountText,
    description: String,
    #[serde(default)]
    shp_params: BTreeMap<String, String>,
}

pub async fn init(
    State(state): State<AppState>,
    actor: Actor,
    body: Result<Json<InitBody>, JsonRejection>,
) -> Result<Json<PaymentInit>> {
    let Json(body) = body?;
    let init = state
        .payments
        .init(
            &actor,
            PaymentRequest {
                booking_id: body.booking_id,
                out_sum: body.out_sum.into_text(),
                description: body.description,
                shp_params: body.shp_params,
            },
        )
        .await?;
    Ok(Json(init))
}

/// Gateway result callback. The plain-text `OK{InvId}` body tells the gateway
/// to stop retrying.
pub async fn result(
    State(state): State<AppState>,
    form: Result<Form<RawPayload>, FormRejection>,
) -> Result<String> {
    let Form(form) = form?;
    let ack = state.payments.handle_result(form).await?;
    Ok(ack.body())
}

/// Browser redirect after checkout. Trust failures still render 200 so the
/// customer sees a page; the payload is kept for audit either way.
pub async fn success(
    State(state): State<AppState>,
    query: Result<Query<RawPayload>, QueryRejection>,
) -> Result<Json<Value>> {
    let Query(query) = query?;
    match state.payments.handle_success(query).await {
        Ok(intent) => Ok(Json(json!({
            "status": "ok",
            "validated": true,
            "inv_id": intent.inv_id,
        }))),
        Err(Error::InvalidSignature | Error::AmountMismatch { .. }) => Ok(Json(json!({
            "status": "ok",
            "validated": false,
        }))),
        Err(e) => Err(e),
    }
}
