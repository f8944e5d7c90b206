use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booking::{AddOn, Booking, BookingDraft, OrderRef, PaymentStatus, PaymentTransition};
use crate::schedule::ChangePolicy;
use crate::trip::{NewTrip, SeatMap, Trip, TripAvailability, TripSearch};
use crate::CoreResult;

/// Repository trait for trip (schedule and seat inventory) access
#[async_trait]
pub trait TripRepository: Send + Sync {
    async fn create_trip(&self, trip: NewTrip) -> CoreResult<Trip>;

    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>>;

    async fn search_trips(&self, search: &TripSearch) -> CoreResult<Vec<TripAvailability>>;

    /// Occupied seats recomputed from active passenger rows.
    async fn seat_map(&self, trip_id: Uuid) -> CoreResult<Option<SeatMap>>;
}

/// A reschedule applied to the trip behind a booking.
#[derive(Debug, Clone)]
pub struct Rescheduled {
    pub booking: Booking,
    pub trip: Trip,
    pub previous_departure: DateTime<Utc>,
}

/// Outcome of one booking creation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingCreation {
    pub booking: Booking,
    /// The order reference was already persisted; nothing was written.
    pub existing: bool,
}

/// Repository trait for booking data access
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// One attempt of the booking creation transaction. Returns the existing
    /// booking unchanged when `draft.order_ref` is already persisted.
    async fn create_booking(&self, draft: &BookingDraft) -> CoreResult<BookingCreation>;

    async fn find_by_order_ref(&self, order_ref: &OrderRef) -> CoreResult<Option<Booking>>;

    async fn list_for_trip(&self, trip_id: Uuid) -> CoreResult<Vec<Booking>>;

    /// pending -> initiated, remembering the provider session.
    async fn record_payment_session(
        &self,
        order_ref: &OrderRef,
        session_id: &str,
    ) -> CoreResult<Booking>;

    /// Idempotent terminal payment update.
    async fn apply_payment_outcome(
        &self,
        order_ref: &OrderRef,
        target: PaymentStatus,
    ) -> CoreResult<(Booking, PaymentTransition)>;

    /// Moves the departure of the booking's outbound trip.
    async fn reschedule(
        &self,
        order_ref: &OrderRef,
        new_departure: DateTime<Utc>,
        policy: ChangePolicy,
    ) -> CoreResult<Rescheduled>;

    async fn add_add_ons(
        &self,
        order_ref: &OrderRef,
        add_ons: &[AddOn],
        policy: ChangePolicy,
    ) -> CoreResult<Booking>;

    /// Cancels and frees the seats. Returns the number of seats released
    /// (zero when it was already cancelled).
    async fn cancel_booking(&self, order_ref: &OrderRef) -> CoreResult<(Booking, usize)>;

    /// Bookings stuck in `initiated` since before `older_than`.
    async fn list_stale_initiated(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<Booking>>;
}
