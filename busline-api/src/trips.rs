use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use busline_core::trip::{SeatMap, TripAvailability, TripSearch};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/trips/search", get(search_trips))
        .route("/v1/trips/{trip_id}/seats", get(seat_map))
}

/// GET /v1/trips/search?origin=..&destination=..&date=YYYY-MM-DD&seats=N
async fn search_trips(
    State(state): State<AppState>,
    Query(search): Query<TripSearch>,
) -> Result<Json<Vec<TripAvailability>>, AppError> {
    if search.seats == 0 {
        return Err(AppError::ValidationError("seats must be at least 1".to_string()));
    }
    let trips = state.trips.search_trips(&search).await?;
    tracing::debug!(
        "Search {} -> {} on {} found {} trips",
        search.origin,
        search.destination,
        search.date,
        trips.len()
    );
    Ok(Json(trips))
}

/// GET /v1/trips/{trip_id}/seats
async fn seat_map(
    State(state): State<AppState>,
    Path(trip_id): Path<Uuid>,
) -> Result<Json<SeatMap>, AppError> {
    state
        .trips
        .seat_map(trip_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFoundError(format!("Trip {} not found", trip_id)))
}
