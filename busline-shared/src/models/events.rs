use uuid::Uuid;

pub const TOPIC_BOOKING_CREATED: &str = "booking.created";
pub const TOPIC_BOOKING_PAID: &str = "booking.paid";
pub const TOPIC_BOOKING_PAYMENT_FAILED: &str = "booking.payment_failed";
pub const TOPIC_BOOKING_RESCHEDULED: &str = "booking.rescheduled";
pub const TOPIC_BOOKING_CANCELLED: &str = "booking.cancelled";

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingCreatedEvent {
    pub booking_id: Uuid,
    pub order_ref: String,
    pub trip_id: Uuid,
    pub return_trip_id: Option<Uuid>,
    pub seat_count: usize,
    pub total_cents: i64,
    pub currency: String,
    pub agent_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PaymentSettledEvent {
    pub booking_id: Uuid,
    pub order_ref: String,
    /// "paid" or "failed"
    pub outcome: String,
    pub total_cents: i64,
    pub currency: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingRescheduledEvent {
    pub booking_id: Uuid,
    pub order_ref: String,
    pub trip_id: Uuid,
    pub previous_departure: i64,
    pub new_departure: i64,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingCancelledEvent {
    pub booking_id: Uuid,
    pub order_ref: String,
    pub released_seats: usize,
    pub timestamp: i64,
}
