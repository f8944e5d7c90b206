use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use busline_booking::{AddOnsRequest, Checkout, RescheduleRequest, SaleChannel};
use busline_core::booking::{Booking, BookingRequest, OrderRef};
use busline_core::trip::Trip;
use busline_core::CoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::middleware::auth::decode_agent;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RescheduleResponse {
    pub booking: Booking,
    pub trip: Trip,
    pub previous_departure: DateTime<Utc>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", post(create_booking))
        .route("/v1/bookings/{order_ref}", get(get_booking))
        .route("/v1/bookings/{order_ref}/verify", post(verify_payment))
        .route("/v1/bookings/{order_ref}/reschedule", post(reschedule))
        .route("/v1/bookings/{order_ref}/add-ons", post(add_add_ons))
}

pub(crate) fn parse_order_ref(value: &str) -> Result<OrderRef, AppError> {
    OrderRef::parse(value).map_err(AppError::from)
}

fn failure_reason(err: &CoreError) -> &'static str {
    match err {
        CoreError::ValidationError(_) | CoreError::NotFound(_) => "validation",
        CoreError::SeatUnavailable { .. } => "seat_unavailable",
        CoreError::Transient(_) => "transient",
        CoreError::ExternalService(_) => "payment_provider",
        _ => "other",
    }
}

/// POST /v1/bookings
/// 201 for a new booking, 200 when the order reference was already handled.
async fn create_booking(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Checkout>), AppError> {
    let channel = match bearer {
        Some(TypedHeader(Authorization(bearer))) => {
            let claims = decode_agent(bearer.token(), &state.auth.secret)?;
            SaleChannel::Agent { agent_id: claims.sub }
        }
        None => SaleChannel::Direct,
    };

    match state.service.create_booking(request, channel).await {
        Ok(checkout) => {
            let status = if checkout.replayed {
                state.metrics.bookings_replayed.inc();
                StatusCode::OK
            } else {
                state.metrics.bookings_created.inc();
                StatusCode::CREATED
            };
            Ok((status, Json(checkout)))
        }
        Err(e) => {
            state
                .metrics
                .booking_failures
                .with_label_values(&[failure_reason(&e)])
                .inc();
            Err(e.into())
        }
    }
}

/// GET /v1/bookings/{order_ref}
async fn get_booking(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<Json<Booking>, AppError> {
    let order_ref = parse_order_ref(&order_ref)?;
    Ok(Json(state.service.get_booking(&order_ref).await?))
}

/// POST /v1/bookings/{order_ref}/verify
async fn verify_payment(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
) -> Result<Json<Booking>, AppError> {
    let order_ref = parse_order_ref(&order_ref)?;
    let before = state.service.get_booking(&order_ref).await?.payment_status;
    let booking = state.service.verify_payment(&order_ref).await?;
    if booking.payment_status != before {
        state
            .metrics
            .payments_reconciled
            .with_label_values(&[booking.payment_status.as_str(), "verify"])
            .inc();
    }
    Ok(Json(booking))
}

/// POST /v1/bookings/{order_ref}/reschedule
async fn reschedule(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<RescheduleResponse>, AppError> {
    let order_ref = parse_order_ref(&order_ref)?;
    let rescheduled = state.service.reschedule(&order_ref, request).await?;
    Ok(Json(RescheduleResponse {
        booking: rescheduled.booking,
        trip: rescheduled.trip,
        previous_departure: rescheduled.previous_departure,
    }))
}

/// POST /v1/bookings/{order_ref}/add-ons
async fn add_add_ons(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
    Json(request): Json<AddOnsRequest>,
) -> Result<Json<Booking>, AppError> {
    let order_ref = parse_order_ref(&order_ref)?;
    Ok(Json(state.service.add_add_ons(&order_ref, request).await?))
}
