use axum::{extract::State, http::header, response::IntoResponse};
use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

use crate::error::AppError;
use crate::state::AppState;

pub struct Metrics {
    registry: Registry,
    pub bookings_created: IntCounter,
    pub bookings_replayed: IntCounter,
    /// Labels: `reason` (validation, seat_unavailable, transient, payment_provider, other)
    pub booking_failures: IntCounterVec,
    /// Labels: `outcome` (paid, failed, settled), `source` (webhook, verify, sweeper)
    pub payments_reconciled: IntCounterVec,
    /// Labels: `result` (applied, duplicate, ignored, rejected)
    pub webhooks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bookings_created = IntCounter::new("busline_bookings_created_total", "Bookings committed")?;
        let bookings_replayed = IntCounter::new(
            "busline_bookings_replayed_total",
            "Booking submissions answered from an earlier execution",
        )?;
        let booking_failures = IntCounterVec::new(
            opts!("busline_booking_failures_total", "Failed booking submissions"),
            &["reason"],
        )?;
        let payments_reconciled = IntCounterVec::new(
            opts!("busline_payments_reconciled_total", "Payment outcomes applied to bookings"),
            &["outcome", "source"],
        )?;
        let webhooks = IntCounterVec::new(
            opts!("busline_payment_webhooks_total", "Payment provider webhooks received"),
            &["result"],
        )?;

        registry.register(Box::new(bookings_created.clone()))?;
        registry.register(Box::new(bookings_replayed.clone()))?;
        registry.register(Box::new(booking_failures.clone()))?;
        registry.register(Box::new(payments_reconciled.clone()))?;
        registry.register(Box::new(webhooks.clone()))?;

        Ok(Self {
            registry,
            bookings_created,
            bookings_replayed,
            booking_failures,
            payments_reconciled,
            webhooks,
        })
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// GET /metrics
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::InternalServerError(format!("metrics encoding failed: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
