use async_trait::async_trait;
use busline_core::booking::Leg;
use busline_core::repository::TripRepository;
use busline_core::trip::{NewTrip, OccupiedSeat, SeatMap, Trip, TripAvailability, TripSearch};
use busline_core::CoreResult;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::map_db_error;

pub struct PostgresTripRepository {
    pub pool: PgPool,
}

impl PostgresTripRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TripRow {
    id: Uuid,
    origin: String,
    destination: String,
    departure_at: DateTime<Utc>,
    arrival_at: DateTime<Utc>,
    bus_label: String,
    total_seats: i32,
    fare_cents: i64,
    currency: String,
}

impl From<TripRow> for Trip {
    fn from(row: TripRow) -> Self {
        Trip {
            id: row.id,
            origin: row.origin,
            destination: row.destination,
            departure_at: row.departure_at,
            arrival_at: row.arrival_at,
            bus_label: row.bus_label,
            total_seats: row.total_seats,
            fare_cents: row.fare_cents,
            currency: row.currency,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AvailabilityRow {
    #[sqlx(flatten)]
    trip: TripRow,
    occupied: i64,
}

pub(crate) const TRIP_COLUMNS: &str =
    "t.id, t.origin, t.destination, t.departure_at, t.arrival_at, t.bus_label, t.total_seats, t.fare_cents, t.currency";

#[async_trait]
impl TripRepository for PostgresTripRepository {
    async fn create_trip(&self, trip: NewTrip) -> CoreResult<Trip> {
        trip.validate()?;
        let trip = trip.into_trip(Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO trips (id, origin, destination, departure_at, arrival_at, bus_label, total_seats, fare_cents, currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(trip.id)
        .bind(&trip.origin)
        .bind(&trip.destination)
        .bind(trip.departure_at)
        .bind(trip.arrival_at)
        .bind(&trip.bus_label)
        .bind(trip.total_seats)
        .bind(trip.fare_cents)
        .bind(&trip.currency)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;

        tracing::info!("Trip {} created: {} -> {} at {}", trip.id, trip.origin, trip.destination, trip.departure_at);
        Ok(trip)
    }

    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>> {
        let row: Option<TripRow> = sqlx::query_as(&format!("SELECT {} FROM trips t WHERE t.id = $1", TRIP_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Trip::from))
    }

    async fn search_trips(&self, search: &TripSearch) -> CoreResult<Vec<TripAvailability>> {
        // Availability is recounted from live passenger rows on every read.
        let rows: Vec<AvailabilityRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}, COUNT(p.id) AS occupied
            FROM trips t
            LEFT JOIN passengers p ON p.trip_id = t.id AND p.active
            WHERE LOWER(t.origin) = LOWER($1)
              AND LOWER(t.destination) = LOWER($2)
              AND (t.departure_at AT TIME ZONE 'UTC')::date = $3
            GROUP BY t.id
            HAVING t.total_seats - COUNT(p.id) >= $4
            ORDER BY t.departure_at
            "#,
            TRIP_COLUMNS
        ))
        .bind(search.origin.trim())
        .bind(search.destination.trim())
        .bind(search.date)
        .bind(search.seats as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows
            .into_iter()
            .map(|row| TripAvailability::new(row.trip.into(), row.occupied))
            .collect())
    }

    async fn seat_map(&self, trip_id: Uuid) -> CoreResult<Option<SeatMap>> {
        let Some(trip) = self.get_trip(trip_id).await? else {
            return Ok(None);
        };

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT seat_label, leg FROM passengers WHERE trip_id = $1 AND active",
        )
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let occupied = rows
            .into_iter()
            .map(|(seat_label, leg)| Ok(OccupiedSeat { seat_label, leg: Leg::parse(&leg)? }))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Some(SeatMap::new(&trip, occupied)))
    }
}
