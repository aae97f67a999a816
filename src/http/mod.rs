//! JSON API over the booking and payment services.

mod bookings;
mod identity;
mod payments;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::{FormRejection, JsonRejection, PathRejection, QueryRejection};
use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::booking::BookingService;
use crate::error::Error;
use crate::observability;
use crate::payment::PaymentService;

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingService>,
    pub payments: Arc<PaymentService>,
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/:id/availability", get(bookings::availability))
        .route("/bookings", post(bookings::create))
        .route("/bookings/:id", get(bookings::show))
        .route("/bookings/:id/confirm", patch(bookings::confirm))
        .route("/bookings/:id/cancel", patch(bookings::cancel))
        .route("/bookings/:id/complete", patch(bookings::complete))
        .route("/bookings/:id/mark-paid", patch(bookings::mark_paid))
        .route("/bookings/:id/deposit", patch(bookings::deposit))
        .route("/payments/init", post(payments::init))
        .route("/payments/result", post(payments::result))
        .route("/payments/success", get(payments::success))
        .layer(middleware::from_fn(track_http))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.bookings.storage_status().await {
        Ok(storage) => Json(json!({ "status": "ok", "storage": storage })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "storage": e.code() })),
            )
                .into_response()
        }
    }
}

async fn track_http(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        observability::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "route" => route
    )
    .record(start.elapsed().as_secs_f64());
    response
}

// Extractor rejections surface as VALIDATION_ERROR in the common envelope.

impl From<JsonRejection> for Error {
    fn from(r: JsonRejection) -> Self {
        Error::Validation(r.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(r: QueryRejection) -> Self {
        Error::Validation(r.body_text())
    }
}

impl From<FormRejection> for Error {
    fn from(r: FormRejection) -> Self {
        Error::Validation(r.body_text())
    }
}

impl From<PathRejection> for Error {
    fn from(r: PathRejection) -> Self {
        Error::Validation(r.body_text())
    }
}
