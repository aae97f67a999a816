use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "studiobook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "studiobook_http_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "studiobook_bookings_created_total";

/// Counter: booking attempts rejected for overlap. Labels: layer (early, storage).
pub const BOOKING_CONFLICTS_TOTAL: &str = "studiobook_booking_conflicts_total";

/// Counter: applied booking commands. Labels: command.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "studiobook_booking_transitions_total";

/// Counter: payment intents created.
pub const PAYMENT_INTENTS_CREATED_TOTAL: &str = "studiobook_payment_intents_created_total";

/// Counter: gateway callbacks. Labels: channel, outcome.
pub const PAYMENT_CALLBACKS_TOTAL: &str = "studiobook_payment_callbacks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: storage calls abandoned at their deadline.
pub const STORAGE_TIMEOUTS_TOTAL: &str = "studiobook_storage_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studiobook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studiobook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
