use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use busline_core::booking::Booking;
use busline_core::trip::{NewTrip, Trip};
use uuid::Uuid;

use crate::bookings::parse_order_ref;
use crate::error::AppError;
use crate::middleware::auth::{admin_auth_middleware, AdminClaims};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/admin/trips", post(create_trip))
        .route("/v1/admin/trips/{trip_id}/bookings", get(list_trip_bookings))
        .route("/v1/admin/bookings/{order_ref}/cancel", post(cancel_booking))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}

/// POST /v1/admin/trips
async fn create_trip(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Json(mut trip): Json<NewTrip>,
) -> Result<(StatusCode, Json<Trip>), AppError> {
    if trip.currency.trim().is_empty() {
        trip.currency = state.default_currency.clone();
    }
    let trip = state.trips.create_trip(trip).await?;
    tracing::info!("Admin {} scheduled trip {}", claims.sub, trip.id);
    Ok((StatusCode::CREATED, Json(trip)))
}

/// GET /v1/admin/trips/{trip_id}/bookings
async fn list_trip_bookings(
    State(state): State<AppState>,
    Path(trip_id): Path<Uuid>,
) -> Result<Json<Vec<Booking>>, AppError> {
    if state.trips.get_trip(trip_id).await?.is_none() {
        return Err(AppError::NotFoundError(format!("Trip {} not found", trip_id)));
    }
    Ok(Json(state.bookings.list_for_trip(trip_id).await?))
}

/// POST /v1/admin/bookings/{order_ref}/cancel
async fn cancel_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(order_ref): Path<String>,
) -> Result<Json<Booking>, AppError> {
    let order_ref = parse_order_ref(&order_ref)?;
    let booking = state.service.cancel_booking(&order_ref).await?;
    tracing::info!("Admin {} cancelled booking {}", claims.sub, order_ref);
    Ok(Json(booking))
}
