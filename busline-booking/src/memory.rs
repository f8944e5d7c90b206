//! In-process repositories with the same transaction semantics as the
//! Postgres store: one lock held for the whole creation, seat uniqueness per
//! (trip, seat) among active passengers, and injectable transient failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use busline_core::booking::{
    normalize_seat, AddOn, Booking, BookingDraft, BookingStatus, Leg, OrderRef, Passenger,
    PaymentStatus, PaymentTransition,
};
use busline_core::repository::{BookingCreation, BookingRepository, Rescheduled, TripRepository};
use busline_core::schedule::ChangePolicy;
use busline_core::trip::{
    ensure_return_after, NewTrip, OccupiedSeat, SeatMap, Trip, TripAvailability, TripSearch,
};
use busline_core::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    trips: HashMap<Uuid, Trip>,
    bookings: HashMap<OrderRef, Booking>,
    injected: VecDeque<CoreError>,
}

impl Tables {
    fn occupied(&self, trip_id: Uuid) -> Vec<OccupiedSeat> {
        self.bookings
            .values()
            .flat_map(|b| b.passengers.iter())
            .filter(|p| p.active && p.trip_id == trip_id)
            .map(|p| OccupiedSeat {
                seat_label: p.seat_label.clone(),
                leg: p.leg,
            })
            .collect()
    }

    fn booking_mut(&mut self, order_ref: &OrderRef) -> CoreResult<&mut Booking> {
        self.bookings
            .get_mut(order_ref)
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", order_ref)))
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    latency: Duration,
    create_attempts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the store lock this long inside every creation, widening the
    /// window in which concurrent attempts contend.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next `n` creation attempts fail as serialization failures.
    pub async fn fail_next_creates(&self, n: usize) {
        let mut tables = self.tables.lock().await;
        for _ in 0..n {
            tables
                .injected
                .push_back(CoreError::Transient("could not serialize access (40001)".to_string()));
        }
    }

    /// The next creation attempt fails with `error`.
    pub async fn inject_create_error(&self, error: CoreError) {
        self.tables.lock().await.injected.push_back(error);
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub async fn booking_count(&self) -> usize {
        self.tables.lock().await.bookings.len()
    }

    /// Passenger rows across all bookings, active or not.
    pub async fn passenger_count(&self) -> usize {
        self.tables
            .lock()
            .await
            .bookings
            .values()
            .map(|b| b.passengers.len())
            .sum()
    }

    /// Rewrites a booking in place; lets tests age rows or seed odd states.
    pub async fn update_booking(&self, order_ref: &OrderRef, f: impl FnOnce(&mut Booking)) -> CoreResult<()> {
        let mut tables = self.tables.lock().await;
        f(tables.booking_mut(order_ref)?);
        Ok(())
    }
}

#[async_trait]
impl TripRepository for InMemoryStore {
    async fn create_trip(&self, trip: NewTrip) -> CoreResult<Trip> {
        trip.validate()?;
        let trip = trip.into_trip(Uuid::new_v4());
        self.tables.lock().await.trips.insert(trip.id, trip.clone());
        Ok(trip)
    }

    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>> {
        Ok(self.tables.lock().await.trips.get(&id).cloned())
    }

    async fn search_trips(&self, search: &TripSearch) -> CoreResult<Vec<TripAvailability>> {
        let tables = self.tables.lock().await;
        let mut found: Vec<TripAvailability> = tables
            .trips
            .values()
            .filter(|t| {
                t.origin.eq_ignore_ascii_case(search.origin.trim())
                    && t.destination.eq_ignore_ascii_case(search.destination.trim())
                    && t.departure_at.date_naive() == search.date
            })
            .map(|t| TripAvailability::new(t.clone(), tables.occupied(t.id).len() as i64))
            .filter(|a| a.available_seats >= search.seats as i64)
            .collect();
        found.sort_by_key(|a| a.trip.departure_at);
        Ok(found)
    }

    async fn seat_map(&self, trip_id: Uuid) -> CoreResult<Option<SeatMap>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .get(&trip_id)
            .map(|trip| SeatMap::new(trip, tables.occupied(trip_id))))
    }
}

#[async_trait]
impl BookingRepository for InMemoryStore {
    async fn create_booking(&self, draft: &BookingDraft) -> CoreResult<BookingCreation> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().await;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = tables.injected.pop_front() {
            return Err(error);
        }

        if let Some(existing) = tables.bookings.get(&draft.order_ref) {
            return Ok(BookingCreation {
                booking: existing.clone(),
                existing: true,
            });
        }

        for (trip_id, _, seats) in draft.legs() {
            let trip = tables
                .trips
                .get(&trip_id)
                .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
            let occupied = tables.occupied(trip_id);

            let taken: Vec<String> = seats
                .iter()
                .map(|s| normalize_seat(s))
                .filter(|s| occupied.iter().any(|o| &o.seat_label == s))
                .collect();
            if !taken.is_empty() {
                return Err(CoreError::SeatUnavailable { trip_id, seats: taken });
            }
            if occupied.len() + seats.len() > trip.total_seats as usize {
                return Err(CoreError::SeatUnavailable {
                    trip_id,
                    seats: seats.iter().map(|s| normalize_seat(s)).collect(),
                });
            }
        }

        let now = Utc::now();
        let booking_id = Uuid::new_v4();
        let passengers = draft
            .passengers
            .iter()
            .map(|detail| Passenger {
                id: Uuid::new_v4(),
                booking_id,
                trip_id: match detail.leg {
                    Leg::Departure => draft.trip_id,
                    Leg::Return => draft.return_trip_id.unwrap_or(draft.trip_id),
                },
                leg: detail.leg,
                seat_label: normalize_seat(&detail.seat_label),
                full_name: detail.full_name.clone(),
                active: true,
            })
            .collect();

        let booking = Booking {
            id: booking_id,
            order_ref: draft.order_ref.clone(),
            trip_id: draft.trip_id,
            return_trip_id: draft.return_trip_id,
            contact: draft.contact.clone(),
            departure_seats: draft.departure_seats.iter().map(|s| normalize_seat(s)).collect(),
            return_seats: draft.return_seats.iter().map(|s| normalize_seat(s)).collect(),
            total_cents: draft.total_cents,
            currency: draft.currency.clone(),
            agent_id: draft.agent_id.clone(),
            commission_cents: draft.commission_cents,
            add_ons: vec![],
            payment_status: PaymentStatus::Pending,
            booking_status: BookingStatus::Confirmed,
            payment_session_id: None,
            passengers,
            created_at: now,
            updated_at: now,
        };
        tables.bookings.insert(booking.order_ref.clone(), booking.clone());

        Ok(BookingCreation {
            booking,
            existing: false,
        })
    }

    async fn find_by_order_ref(&self, order_ref: &OrderRef) -> CoreResult<Option<Booking>> {
        Ok(self.tables.lock().await.bookings.get(order_ref).cloned())
    }

    async fn list_for_trip(&self, trip_id: Uuid) -> CoreResult<Vec<Booking>> {
        let tables = self.tables.lock().await;
        let mut bookings: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| b.trip_id == trip_id || b.return_trip_id == Some(trip_id))
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    async fn record_payment_session(
        &self,
        order_ref: &OrderRef,
        session_id: &str,
    ) -> CoreResult<Booking> {
        let mut tables = self.tables.lock().await;
        let booking = tables.booking_mut(order_ref)?;
        if booking.payment_status.transition_to(PaymentStatus::Initiated) == PaymentTransition::Applied {
            booking.payment_status = PaymentStatus::Initiated;
        }
        booking.payment_session_id = Some(session_id.to_string());
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn apply_payment_outcome(
        &self,
        order_ref: &OrderRef,
        target: PaymentStatus,
    ) -> CoreResult<(Booking, PaymentTransition)> {
        let mut tables = self.tables.lock().await;
        let booking = tables.booking_mut(order_ref)?;
        let transition = booking.payment_status.transition_to(target);
        if transition == PaymentTransition::Applied {
            booking.payment_status = target;
            booking.updated_at = Utc::now();
        }
        Ok((booking.clone(), transition))
    }

    async fn reschedule(
        &self,
        order_ref: &OrderRef,
        new_departure: DateTime<Utc>,
        policy: ChangePolicy,
    ) -> CoreResult<Rescheduled> {
        let mut tables = self.tables.lock().await;
        let booking = tables
            .bookings
            .get(order_ref)
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", order_ref)))?;
        if booking.booking_status == BookingStatus::Cancelled {
            return Err(CoreError::Conflict(format!("booking {} is cancelled", order_ref)));
        }
        let trip_id = booking.trip_id;
        if let Some(return_trip_id) = booking.return_trip_id {
            let inbound = tables
                .trips
                .get(&return_trip_id)
                .ok_or_else(|| CoreError::NotFound(format!("trip {}", return_trip_id)))?;
            ensure_return_after(new_departure, inbound.departure_at)?;
        }

        let trip = tables
            .trips
            .get_mut(&trip_id)
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
        policy.ensure_open(trip.departure_at)?;

        let previous_departure = trip.departure_at;
        let duration = trip.arrival_at - trip.departure_at;
        trip.departure_at = new_departure;
        trip.arrival_at = new_departure + duration;
        let trip = trip.clone();

        let booking = tables.booking_mut(order_ref)?;
        booking.booking_status = BookingStatus::Rescheduled;
        booking.updated_at = Utc::now();

        Ok(Rescheduled {
            booking: booking.clone(),
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
        let mut tables = self.tables.lock().await;
        let booking = tables
            .bookings
            .get(order_ref)
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", order_ref)))?;
        if booking.booking_status == BookingStatus::Cancelled {
            return Err(CoreError::Conflict(format!("booking {} is cancelled", order_ref)));
        }
        let departure_at = tables
            .trips
            .get(&booking.trip_id)
            .map(|t| t.departure_at)
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", booking.trip_id)))?;
        policy.ensure_open(departure_at)?;

        let booking = tables.booking_mut(order_ref)?;
        booking.total_cents = booking.total_with_add_ons(add_ons)?;
        booking.add_ons.extend_from_slice(add_ons);
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn cancel_booking(&self, order_ref: &OrderRef) -> CoreResult<(Booking, usize)> {
        let mut tables = self.tables.lock().await;
        let booking = tables.booking_mut(order_ref)?;
        if booking.booking_status == BookingStatus::Cancelled {
            return Ok((booking.clone(), 0));
        }

        let mut released = 0;
        for passenger in booking.passengers.iter_mut().filter(|p| p.active) {
            passenger.active = false;
            released += 1;
        }
        booking.booking_status = BookingStatus::Cancelled;
        booking.updated_at = Utc::now();
        Ok((booking.clone(), released))
    }

    async fn list_stale_initiated(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Booking>> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<Booking> = tables
            .bookings
            .values()
            .filter(|b| b.payment_status == PaymentStatus::Initiated && b.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::booking::{ContactDetails, PassengerDetail};
    use busline_shared::Masked;
    use chrono::Duration as ChronoDuration;

    async fn seeded() -> (InMemoryStore, Trip) {
        let store = InMemoryStore::new();
        let departure = Utc::now() + ChronoDuration::days(2);
        let trip = store
            .create_trip(NewTrip {
                origin: "Cluj".to_string(),
                destination: "Sibiu".to_string(),
                departure_at: departure,
                arrival_at: departure + ChronoDuration::hours(3),
                bus_label: "B1".to_string(),
                total_seats: 3,
                fare_cents: 5000,
                currency: "RON".to_string(),
            })
            .await
            .unwrap();
        (store, trip)
    }

    fn draft(order_ref: &str, trip: &Trip, seats: &[&str]) -> BookingDraft {
        BookingDraft {
            order_ref: OrderRef::parse(order_ref).unwrap(),
            trip_id: trip.id,
            return_trip_id: None,
            contact: ContactDetails {
                full_name: "Ana Pop".to_string(),
                email: Masked::from("ana@example.com"),
                phone: Masked::from("0721000111"),
                id_number: None,
            },
            departure_seats: seats.iter().map(|s| s.to_string()).collect(),
            return_seats: vec![],
            passengers: seats
                .iter()
                .map(|s| PassengerDetail {
                    full_name: "Ana Pop".to_string(),
                    seat_label: s.to_string(),
                    leg: Leg::Departure,
                })
                .collect(),
            total_cents: 5000 * seats.len() as i64,
            currency: "RON".to_string(),
            agent_id: None,
            commission_cents: 0,
        }
    }

    #[tokio::test]
    async fn test_existing_order_ref_is_returned_unchanged() {
        let (store, trip) = seeded().await;
        let first = store.create_booking(&draft("RT-AAA111", &trip, &["1a"])).await.unwrap();
        assert!(!first.existing);
        assert_eq!(first.booking.departure_seats, vec!["1A".to_string()]);

        let again = store.create_booking(&draft("RT-AAA111", &trip, &["1A"])).await.unwrap();
        assert!(again.existing);
        assert_eq!(again.booking.id, first.booking.id);
        assert_eq!(store.passenger_count().await, 1);
    }

    #[tokio::test]
    async fn test_taken_seats_and_capacity_are_enforced() {
        let (store, trip) = seeded().await;
        store.create_booking(&draft("RT-AAA111", &trip, &["1A", "1B"])).await.unwrap();

        let err = store.create_booking(&draft("RT-BBB222", &trip, &["1B"])).await.unwrap_err();
        assert_eq!(err, CoreError::SeatUnavailable { trip_id: trip.id, seats: vec!["1B".into()] });

        let err = store.create_booking(&draft("RT-CCC333", &trip, &["2A", "2B"])).await.unwrap_err();
        assert!(matches!(err, CoreError::SeatUnavailable { .. }));
        assert_eq!(store.booking_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_seats_once() {
        let (store, trip) = seeded().await;
        let created = store.create_booking(&draft("RT-AAA111", &trip, &["1A", "1B"])).await.unwrap();
        let order_ref = created.booking.order_ref;

        let (_, released) = store.cancel_booking(&order_ref).await.unwrap();
        assert_eq!(released, 2);
        let (cancelled, released) = store.cancel_booking(&order_ref).await.unwrap();
        assert_eq!(released, 0);
        assert_eq!(cancelled.booking_status, BookingStatus::Cancelled);

        let map = store.seat_map(trip.id).await.unwrap().unwrap();
        assert_eq!(map.available_seats, 3);
        store.create_booking(&draft("RT-BBB222", &trip, &["1A"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures_leave_no_rows() {
        let (store, trip) = seeded().await;
        store.fail_next_creates(1).await;

        let err = store.create_booking(&draft("RT-AAA111", &trip, &["1A"])).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.booking_count().await, 0);
        assert_eq!(store.create_attempts(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_add_ons_leave_booking_untouched() {
        let (store, trip) = seeded().await;
        let created = store.create_booking(&draft("RT-AAA111", &trip, &["1A"])).await.unwrap();
        let order_ref = created.booking.order_ref;
        let policy = ChangePolicy::new(Utc::now(), 24);
        let huge = AddOn {
            code: "BAG".to_string(),
            description: "Extra luggage".to_string(),
            price_cents: i64::MAX,
        };

        let err = store.add_add_ons(&order_ref, &[huge], policy).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        let booking = store.find_by_order_ref(&order_ref).await.unwrap().unwrap();
        assert_eq!(booking.total_cents, 5000);
        assert!(booking.add_ons.is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_cannot_pass_return_trip() {
        let (store, outbound) = seeded().await;
        let back = outbound.departure_at + ChronoDuration::days(2);
        let inbound = store
            .create_trip(NewTrip {
                origin: "Sibiu".to_string(),
                destination: "Cluj".to_string(),
                departure_at: back,
                arrival_at: back + ChronoDuration::hours(3),
                bus_label: "B2".to_string(),
                total_seats: 3,
                fare_cents: 5000,
                currency: "RON".to_string(),
            })
            .await
            .unwrap();
        let mut round_trip = draft("RT-AAA111", &outbound, &["1A"]);
        round_trip.return_trip_id = Some(inbound.id);
        round_trip.return_seats = vec!["2A".to_string()];
        let order_ref = store.create_booking(&round_trip).await.unwrap().booking.order_ref;
        let policy = ChangePolicy::new(Utc::now(), 24);

        let err = store
            .reschedule(&order_ref, back + ChronoDuration::hours(1), policy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        let unchanged = store.get_trip(outbound.id).await.unwrap().unwrap();
        assert_eq!(unchanged.departure_at, outbound.departure_at);

        let moved = store
            .reschedule(&order_ref, back - ChronoDuration::hours(6), policy)
            .await
            .unwrap();
        assert_eq!(moved.trip.departure_at, back - ChronoDuration::hours(6));
    }
}
