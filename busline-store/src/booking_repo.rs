use std::collections::HashMap;

use async_trait::async_trait;
use busline_core::booking::{
    normalize_seat, AddOn, Booking, BookingDraft, BookingStatus, ContactDetails, Leg, OrderRef,
    Passenger, PaymentStatus, PaymentTransition,
};
use busline_core::repository::{BookingCreation, BookingRepository, Rescheduled};
use busline_core::schedule::ChangePolicy;
use busline_core::trip::{ensure_return_after, Trip};
use busline_core::{CoreError, CoreResult};
use busline_shared::Masked;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::app_config::DatabaseConfig;
use crate::database::{map_db_error, ACTIVE_SEAT_CONSTRAINT};
use crate::trip_repo::{TripRow, TRIP_COLUMNS};

pub struct PostgresBookingRepository {
    pool: PgPool,
    lock_timeout_ms: u64,
    statement_timeout_ms: u64,
}

impl PostgresBookingRepository {
    pub fn new(pool: PgPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            lock_timeout_ms: config.lock_timeout_ms,
            statement_timeout_ms: config.statement_timeout_ms,
        }
    }

    /// Read-committed transaction with bounded lock wait and duration;
    /// exceeding either surfaces as a transient error.
    async fn begin(&self) -> CoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = '{}ms'", self.statement_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(tx)
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    order_ref: String,
    trip_id: Uuid,
    return_trip_id: Option<Uuid>,
    contact_name: String,
    contact_email: String,
    contact_phone: String,
    contact_id_number: Option<String>,
    departure_seats: Vec<String>,
    return_seats: Vec<String>,
    total_cents: i64,
    currency: String,
    agent_id: Option<String>,
    commission_cents: i64,
    add_ons: Json<Vec<AddOn>>,
    payment_status: String,
    booking_status: String,
    payment_session_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PassengerRow {
    id: Uuid,
    booking_id: Uuid,
    trip_id: Uuid,
    leg: String,
    seat_label: String,
    full_name: String,
    active: bool,
}

impl PassengerRow {
    fn into_passenger(self) -> CoreResult<Passenger> {
        Ok(Passenger {
            id: self.id,
            booking_id: self.booking_id,
            trip_id: self.trip_id,
            leg: Leg::parse(&self.leg)?,
            seat_label: self.seat_label,
            full_name: self.full_name,
            active: self.active,
        })
    }
}

impl BookingRow {
    fn into_booking(self, passengers: Vec<Passenger>) -> CoreResult<Booking> {
        Ok(Booking {
            id: self.id,
            order_ref: OrderRef::parse(&self.order_ref)?,
            trip_id: self.trip_id,
            return_trip_id: self.return_trip_id,
            contact: ContactDetails {
                full_name: self.contact_name,
                email: Masked::new(self.contact_email),
                phone: Masked::new(self.contact_phone),
                id_number: self.contact_id_number.map(Masked::new),
            },
            departure_seats: self.departure_seats,
            return_seats: self.return_seats,
            total_cents: self.total_cents,
            currency: self.currency,
            agent_id: self.agent_id,
            commission_cents: self.commission_cents,
            add_ons: self.add_ons.0,
            payment_status: PaymentStatus::parse(&self.payment_status)?,
            booking_status: BookingStatus::parse(&self.booking_status)?,
            payment_session_id: self.payment_session_id,
            passengers,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const BOOKING_COLUMNS: &str = "id, order_ref, trip_id, return_trip_id, contact_name, contact_email, \
    contact_phone, contact_id_number, departure_seats, return_seats, total_cents, currency, agent_id, \
    commission_cents, add_ons, payment_status, booking_status, payment_session_id, created_at, updated_at";

const PASSENGER_COLUMNS: &str = "id, booking_id, trip_id, leg, seat_label, full_name, active";

/// Loads one booking with its passengers, optionally taking the row lock.
async fn load_booking(conn: &mut PgConnection, order_ref: &OrderRef, for_update: bool) -> CoreResult<Option<Booking>> {
    let sql = format!(
        "SELECT {} FROM bookings WHERE order_ref = $1{}",
        BOOKING_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<BookingRow> = sqlx::query_as(&sql)
        .bind(order_ref.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut passengers = load_passengers(conn, &[row.id]).await?;
    let own = passengers.remove(&row.id).unwrap_or_default();
    Ok(Some(row.into_booking(own)?))
}

async fn load_passengers(conn: &mut PgConnection, booking_ids: &[Uuid]) -> CoreResult<HashMap<Uuid, Vec<Passenger>>> {
    let rows: Vec<PassengerRow> = sqlx::query_as(&format!(
        "SELECT {} FROM passengers WHERE booking_id = ANY($1) ORDER BY leg, seat_label",
        PASSENGER_COLUMNS
    ))
    .bind(booking_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(map_db_error)?;

    let mut grouped: HashMap<Uuid, Vec<Passenger>> = HashMap::new();
    for row in rows {
        let passenger = row.into_passenger()?;
        grouped.entry(passenger.booking_id).or_default().push(passenger);
    }
    Ok(grouped)
}

async fn load_many(conn: &mut PgConnection, rows: Vec<BookingRow>) -> CoreResult<Vec<Booking>> {
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let mut passengers = load_passengers(conn, &ids).await?;
    rows.into_iter()
        .map(|row| {
            let own = passengers.remove(&row.id).unwrap_or_default();
            row.into_booking(own)
        })
        .collect()
}

async fn lock_trip(conn: &mut PgConnection, trip_id: Uuid) -> CoreResult<Trip> {
    let row: Option<TripRow> = sqlx::query_as(&format!(
        "SELECT {} FROM trips t WHERE t.id = $1 FOR UPDATE",
        TRIP_COLUMNS
    ))
    .bind(trip_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_db_error)?;
    row.map(Trip::from)
        .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))
}

fn not_found(order_ref: &OrderRef) -> CoreError {
    CoreError::NotFound(format!("booking {}", order_ref))
}

fn ensure_active(booking: &Booking) -> CoreResult<()> {
    if booking.booking_status == BookingStatus::Cancelled {
        return Err(CoreError::Conflict(format!("booking {} is cancelled", booking.order_ref)));
    }
    Ok(())
}

#[async_trait]
impl BookingRepository for PostgresBookingRepository {
    async fn create_booking(&self, draft: &BookingDraft) -> CoreResult<BookingCreation> {
        let mut tx = self.begin().await?;

        if let Some(existing) = load_booking(&mut tx, &draft.order_ref, false).await? {
            tx.commit().await.map_err(map_db_error)?;
            return Ok(BookingCreation {
                booking: existing,
                existing: true,
            });
        }

        // Lock in id order so two bookings over the same pair of trips
        // cannot deadlock each other.
        let mut legs = draft.legs();
        legs.sort_by_key(|(trip_id, _, _)| *trip_id);

        for (trip_id, _, seats) in &legs {
            let trip = lock_trip(&mut tx, *trip_id).await?;
            let wanted: Vec<String> = seats.iter().map(|s| normalize_seat(s)).collect();

            let occupied: Vec<(String,)> = sqlx::query_as(
                "SELECT seat_label FROM passengers WHERE trip_id = $1 AND active",
            )
            .bind(trip_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_error)?;

            let taken: Vec<String> = wanted
                .iter()
                .filter(|s| occupied.iter().any(|(o,)| o == *s))
                .cloned()
                .collect();
            if !taken.is_empty() {
                return Err(CoreError::SeatUnavailable { trip_id: *trip_id, seats: taken });
            }
            if occupied.len() + wanted.len() > trip.total_seats as usize {
                return Err(CoreError::SeatUnavailable { trip_id: *trip_id, seats: wanted });
            }
        }

        let booking_id = Uuid::new_v4();
        let departure_seats: Vec<String> = draft.departure_seats.iter().map(|s| normalize_seat(s)).collect();
        let return_seats: Vec<String> = draft.return_seats.iter().map(|s| normalize_seat(s)).collect();

        sqlx::query(
            r#"
            INSERT INTO bookings (id, order_ref, trip_id, return_trip_id, contact_name, contact_email,
                contact_phone, contact_id_number, departure_seats, return_seats, total_cents, currency,
                agent_id, commission_cents, payment_status, booking_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 'pending', 'confirmed')
            "#,
        )
        .bind(booking_id)
        .bind(draft.order_ref.as_str())
        .bind(draft.trip_id)
        .bind(draft.return_trip_id)
        .bind(draft.contact.full_name.trim())
        .bind(draft.contact.email.expose().trim())
        .bind(draft.contact.phone.expose().trim())
        .bind(draft.contact.id_number.as_ref().map(|m| m.expose().clone()))
        .bind(&departure_seats)
        .bind(&return_seats)
        .bind(draft.total_cents)
        .bind(&draft.currency)
        .bind(&draft.agent_id)
        .bind(draft.commission_cents)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        for detail in &draft.passengers {
            let trip_id = match detail.leg {
                Leg::Departure => draft.trip_id,
                Leg::Return => draft.return_trip_id.unwrap_or(draft.trip_id),
            };
            let seat = normalize_seat(&detail.seat_label);

            sqlx::query(
                r#"
                INSERT INTO passengers (id, booking_id, trip_id, leg, seat_label, full_name, active)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(booking_id)
            .bind(trip_id)
            .bind(detail.leg.as_str())
            .bind(&seat)
            .bind(detail.full_name.trim())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                let seat_clash = matches!(
                    &e,
                    sqlx::Error::Database(db) if db.constraint() == Some(ACTIVE_SEAT_CONSTRAINT)
                );
                if seat_clash {
                    CoreError::SeatUnavailable { trip_id, seats: vec![seat.clone()] }
                } else {
                    map_db_error(e)
                }
            })?;
        }

        let booking = load_booking(&mut tx, &draft.order_ref, false)
            .await?
            .ok_or_else(|| CoreError::InternalError(format!("booking {} vanished before commit", draft.order_ref)))?;
        tx.commit().await.map_err(map_db_error)?;

        Ok(BookingCreation {
            booking,
            existing: false,
        })
    }

    async fn find_by_order_ref(&self, order_ref: &OrderRef) -> CoreResult<Option<Booking>> {
        let mut conn = self.pool.acquire().await.map_err(map_db_error)?;
        load_booking(&mut conn, order_ref, false).await
    }

    async fn list_for_trip(&self, trip_id: Uuid) -> CoreResult<Vec<Booking>> {
        let mut conn = self.pool.acquire().await.map_err(map_db_error)?;
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE trip_id = $1 OR return_trip_id = $1 ORDER BY created_at",
            BOOKING_COLUMNS
        ))
        .bind(trip_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_db_error)?;
        load_many(&mut conn, rows).await
    }

    async fn record_payment_session(&self, order_ref: &OrderRef, session_id: &str) -> CoreResult<Booking> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET payment_session_id = $2,
                payment_status = CASE WHEN payment_status = 'pending' THEN 'initiated' ELSE payment_status END,
                updated_at = NOW()
            WHERE order_ref = $1
            "#,
        )
        .bind(order_ref.as_str())
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(not_found(order_ref));
        }

        let booking = load_booking(&mut tx, order_ref, false)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(booking)
    }

    async fn apply_payment_outcome(
        &self,
        order_ref: &OrderRef,
        target: PaymentStatus,
    ) -> CoreResult<(Booking, PaymentTransition)> {
        let mut tx = self.begin().await?;
        let mut booking = load_booking(&mut tx, order_ref, true)
            .await?
            .ok_or_else(|| not_found(order_ref))?;

        let transition = booking.payment_status.transition_to(target);
        if transition == PaymentTransition::Applied {
            sqlx::query("UPDATE bookings SET payment_status = $2, updated_at = NOW() WHERE id = $1")
                .bind(booking.id)
                .bind(target.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
            booking.payment_status = target;
            booking.updated_at = Utc::now();
        }
        tx.commit().await.map_err(map_db_error)?;
        Ok((booking, transition))
    }

    async fn reschedule(
        &self,
        order_ref: &OrderRef,
        new_departure: DateTime<Utc>,
        policy: ChangePolicy,
    ) -> CoreResult<Rescheduled> {
        let mut tx = self.begin().await?;
        let booking = load_booking(&mut tx, order_ref, true)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        ensure_active(&booking)?;

        let mut trip = lock_trip(&mut tx, booking.trip_id).await?;
        policy.ensure_open(trip.departure_at)?;
        if let Some(return_trip_id) = booking.return_trip_id {
            let (return_departure,): (DateTime<Utc>,) =
                sqlx::query_as("SELECT departure_at FROM trips WHERE id = $1")
                    .bind(return_trip_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_db_error)?;
            ensure_return_after(new_departure, return_departure)?;
        }

        let previous_departure = trip.departure_at;
        let duration = trip.arrival_at - trip.departure_at;
        trip.departure_at = new_departure;
        trip.arrival_at = new_departure + duration;

        sqlx::query("UPDATE trips SET departure_at = $2, arrival_at = $3, updated_at = NOW() WHERE id = $1")
            .bind(trip.id)
            .bind(trip.departure_at)
            .bind(trip.arrival_at)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        sqlx::query("UPDATE bookings SET booking_status = 'rescheduled', updated_at = NOW() WHERE id = $1")
            .bind(booking.id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

        let booking = load_booking(&mut tx, order_ref, false)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        tx.commit().await.map_err(map_db_error)?;

        Ok(Rescheduled {
            booking,
            trip,
            previous_departure,
        })
    }

    async fn add_add_ons(
        &self,
        order_ref: &OrderRef,
        add_ons: &[AddOn],
        policy: ChangePolicy,
    ) -> CoreResult<Booking> {
        let mut tx = self.begin().await?;
        let booking = load_booking(&mut tx, order_ref, true)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        ensure_active(&booking)?;

        let (departure_at,): (DateTime<Utc>,) = sqlx::query_as("SELECT departure_at FROM trips WHERE id = $1")
            .bind(booking.trip_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_error)?;
        policy.ensure_open(departure_at)?;

        // the row is locked, so the total computed here is current
        let total_cents = booking.total_with_add_ons(add_ons)?;
        sqlx::query(
            r#"
            UPDATE bookings
            SET add_ons = add_ons || $2, total_cents = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(booking.id)
        .bind(Json(add_ons))
        .bind(total_cents)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let booking = load_booking(&mut tx, order_ref, false)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(booking)
    }

    async fn cancel_booking(&self, order_ref: &OrderRef) -> CoreResult<(Booking, usize)> {
        let mut tx = self.begin().await?;
        let booking = load_booking(&mut tx, order_ref, true)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        if booking.booking_status == BookingStatus::Cancelled {
            tx.commit().await.map_err(map_db_error)?;
            return Ok((booking, 0));
        }

        let released = sqlx::query("UPDATE passengers SET active = FALSE WHERE booking_id = $1 AND active")
            .bind(booking.id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
        sqlx::query("UPDATE bookings SET booking_status = 'cancelled', updated_at = NOW() WHERE id = $1")
            .bind(booking.id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

        let booking = load_booking(&mut tx, order_ref, false)
            .await?
            .ok_or_else(|| not_found(order_ref))?;
        tx.commit().await.map_err(map_db_error)?;
        Ok((booking, released as usize))
    }

    async fn list_stale_initiated(&self, older_than: DateTime<Utc>, limit: i64) -> CoreResult<Vec<Booking>> {
        let mut conn = self.pool.acquire().await.map_err(map_db_error)?;
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE payment_status = 'initiated' AND updated_at < $1 \
             ORDER BY updated_at LIMIT $2",
            BOOKING_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_db_error)?;
        load_many(&mut conn, rows).await
    }
}
