use busline_shared::Masked;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::{CoreError, CoreResult};

const MAX_SEATS_PER_LEG: usize = 10;

/// Client-visible identifier of one booking attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderRef(String);

impl OrderRef {
    pub fn parse(value: &str) -> CoreResult<Self> {
        let value = value.trim();
        if value.len() < 4 || value.len() > 64 {
            return Err(CoreError::ValidationError(
                "order_ref must be between 4 and 64 characters".to_string(),
            ));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::ValidationError(format!(
                "order_ref contains invalid characters: {}",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderRef {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OrderRef::parse(&value)
    }
}

impl From<OrderRef> for String {
    fn from(value: OrderRef) -> Self {
        value.0
    }
}

/// Departure or return portion of a round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Departure,
    Return,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Departure => "departure",
            Leg::Return => "return",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "departure" => Ok(Leg::Departure),
            "return" => Ok(Leg::Return),
            other => Err(CoreError::InternalError(format!("unknown leg: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Initiated,
    Paid,
    Failed,
}

/// Result of applying a payment status change to a booking.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTransition {
    /// Status changed; side effects should fire.
    Applied,
    /// Booking was already in the requested state.
    AlreadyApplied,
    /// Requested change is not allowed from the current state (e.g. paid is final).
    Ignored,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "pending" => Ok(PaymentStatus::Pending),
            "initiated" => Ok(PaymentStatus::Initiated),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(CoreError::InternalError(format!(
                "unknown payment status: {}",
                other
            ))),
        }
    }

    /// pending -> initiated -> paid | failed, with failed -> paid allowed for
    /// late successes. Paid never moves.
    pub fn transition_to(self, target: PaymentStatus) -> PaymentTransition {
        use PaymentStatus::*;

        if self == target {
            return PaymentTransition::AlreadyApplied;
        }
        match (self, target) {
            (Pending, Initiated) => PaymentTransition::Applied,
            (Pending | Initiated, Paid | Failed) => PaymentTransition::Applied,
            (Failed, Paid) => PaymentTransition::Applied,
            _ => PaymentTransition::Ignored,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Rescheduled,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rescheduled => "rescheduled",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "rescheduled" => Ok(BookingStatus::Rescheduled),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(CoreError::InternalError(format!(
                "unknown booking status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContactDetails {
    pub full_name: String,
    pub email: Masked<String>,
    pub phone: Masked<String>,
    pub id_number: Option<Masked<String>>,
}

impl ContactDetails {
    pub fn validate(&self) -> CoreResult<()> {
        if self.full_name.trim().is_empty() {
            return Err(CoreError::ValidationError("contact name is required".to_string()));
        }
        let email = self.email.expose().trim();
        let valid_email = match email.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.'),
            None => false,
        };
        if !valid_email {
            return Err(CoreError::ValidationError("contact email is malformed".to_string()));
        }
        let digits = self
            .phone
            .expose()
            .chars()
            .filter(|c| c.is_ascii_digit())
            .count();
        if digits < 6 {
            return Err(CoreError::ValidationError("contact phone is malformed".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddOn {
    pub code: String,
    pub description: String,
    pub price_cents: i64,
}

impl AddOn {
    pub fn total(add_ons: &[AddOn]) -> CoreResult<i64> {
        add_ons
            .iter()
            .try_fold(0i64, |acc, a| acc.checked_add(a.price_cents))
            .ok_or_else(|| CoreError::ValidationError("add-on total is out of range".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passenger {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub trip_id: Uuid,
    pub leg: Leg,
    pub seat_label: String,
    pub full_name: String,
    pub active: bool,
}

/// Named occupant supplied by the client for one selected seat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassengerDetail {
    pub full_name: String,
    pub seat_label: String,
    #[serde(default = "default_leg")]
    pub leg: Leg,
}

fn default_leg() -> Leg {
    Leg::Departure
}

/// Inbound booking request, validated at the boundary before pricing.
#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub order_ref: Option<String>,
    pub trip_id: Uuid,
    pub return_trip_id: Option<Uuid>,
    pub contact: ContactDetails,
    pub seats: Vec<String>,
    #[serde(default)]
    pub return_seats: Vec<String>,
    #[serde(default)]
    pub passengers: Vec<PassengerDetail>,
}

impl BookingRequest {
    pub fn validate(&self) -> CoreResult<()> {
        self.contact.validate()?;

        if self.seats.is_empty() {
            return Err(CoreError::ValidationError("at least one seat must be selected".to_string()));
        }
        validate_seats("seats", &self.seats)?;

        match (self.return_trip_id, self.return_seats.is_empty()) {
            (Some(_), true) => {
                return Err(CoreError::ValidationError(
                    "return_seats are required when return_trip_id is set".to_string(),
                ))
            }
            (None, false) => {
                return Err(CoreError::ValidationError(
                    "return_seats given without return_trip_id".to_string(),
                ))
            }
            (Some(return_trip), false) => {
                if return_trip == self.trip_id {
                    return Err(CoreError::ValidationError(
                        "return trip must differ from departure trip".to_string(),
                    ));
                }
                validate_seats("return_seats", &self.return_seats)?;
            }
            (None, true) => {}
        }

        for detail in &self.passengers {
            if detail.full_name.trim().is_empty() {
                return Err(CoreError::ValidationError("passenger name is required".to_string()));
            }
            let selected = match detail.leg {
                Leg::Departure => &self.seats,
                Leg::Return => &self.return_seats,
            };
            if !selected.iter().any(|s| s.eq_ignore_ascii_case(&detail.seat_label)) {
                return Err(CoreError::ValidationError(format!(
                    "passenger seat {} is not part of the {} selection",
                    detail.seat_label,
                    detail.leg.as_str()
                )));
            }
        }

        Ok(())
    }
}

fn validate_seats(field: &str, seats: &[String]) -> CoreResult<()> {
    if seats.len() > MAX_SEATS_PER_LEG {
        return Err(CoreError::ValidationError(format!(
            "{} may contain at most {} seats",
            field, MAX_SEATS_PER_LEG
        )));
    }
    let mut seen = HashSet::new();
    for seat in seats {
        let label = seat.trim();
        if label.is_empty() || label.len() > 8 || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::ValidationError(format!("invalid seat label in {}: {:?}", field, seat)));
        }
        if !seen.insert(label.to_ascii_uppercase()) {
            return Err(CoreError::ValidationError(format!("duplicate seat in {}: {}", field, label)));
        }
    }
    Ok(())
}

/// Normalised seat label as stored (trimmed, upper-case).
pub fn normalize_seat(label: &str) -> String {
    label.trim().to_ascii_uppercase()
}

/// A priced, validated booking ready for the creation transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingDraft {
    pub order_ref: OrderRef,
    pub trip_id: Uuid,
    pub return_trip_id: Option<Uuid>,
    pub contact: ContactDetails,
    pub departure_seats: Vec<String>,
    pub return_seats: Vec<String>,
    /// One entry per seat on every leg.
    pub passengers: Vec<PassengerDetail>,
    pub total_cents: i64,
    pub currency: String,
    pub agent_id: Option<String>,
    pub commission_cents: i64,
}

impl BookingDraft {
    pub fn seat_count(&self) -> usize {
        self.departure_seats.len() + self.return_seats.len()
    }

    /// (trip, leg, seats) per leg, departure first.
    pub fn legs(&self) -> Vec<(Uuid, Leg, &[String])> {
        let mut legs = vec![(self.trip_id, Leg::Departure, self.departure_seats.as_slice())];
        if let Some(return_trip) = self.return_trip_id {
            legs.push((return_trip, Leg::Return, self.return_seats.as_slice()));
        }
        legs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Booking {
    pub id: Uuid,
    pub order_ref: OrderRef,
    pub trip_id: Uuid,
    pub return_trip_id: Option<Uuid>,
    pub contact: ContactDetails,
    pub departure_seats: Vec<String>,
    pub return_seats: Vec<String>,
    pub total_cents: i64,
    pub currency: String,
    pub agent_id: Option<String>,
    pub commission_cents: i64,
    pub add_ons: Vec<AddOn>,
    pub payment_status: PaymentStatus,
    pub booking_status: BookingStatus,
    pub payment_session_id: Option<String>,
    pub passengers: Vec<Passenger>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn seat_count(&self) -> usize {
        self.departure_seats.len() + self.return_seats.len()
    }

    /// Whether an existing row describes the same purchase as `draft`, used
    /// when a duplicate order reference is hit at the storage layer.
    pub fn matches_draft(&self, draft: &BookingDraft) -> bool {
        self.trip_id == draft.trip_id
            && self.return_trip_id == draft.return_trip_id
            && same_seats(&self.departure_seats, &draft.departure_seats)
            && same_seats(&self.return_seats, &draft.return_seats)
    }

    /// Booking total once `add_ons` are charged on top.
    pub fn total_with_add_ons(&self, add_ons: &[AddOn]) -> CoreResult<i64> {
        AddOn::total(add_ons)?
            .checked_add(self.total_cents)
            .ok_or_else(|| CoreError::ValidationError("booking total is out of range".to_string()))
    }
}

fn same_seats(a: &[String], b: &[String]) -> bool {
    let a: HashSet<String> = a.iter().map(|s| normalize_seat(s)).collect();
    let b: HashSet<String> = b.iter().map(|s| normalize_seat(s)).collect();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ContactDetails {
        ContactDetails {
            full_name: "Ana Pop".to_string(),
            email: Masked::from("ana@example.com"),
            phone: Masked::from("+40 721 000 111"),
            id_number: None,
        }
    }

    fn request() -> BookingRequest {
        BookingRequest {
            order_ref: Some("RT-ABC123".to_string()),
            trip_id: Uuid::new_v4(),
            return_trip_id: None,
            contact: contact(),
            seats: vec!["12A".to_string(), "12B".to_string()],
            return_seats: vec![],
            passengers: vec![],
        }
    }

    #[test]
    fn test_order_ref_validation() {
        assert!(OrderRef::parse("RT-ABC123").is_ok());
        assert!(OrderRef::parse("abc").is_err());
        assert!(OrderRef::parse("RT ABC 123").is_err());
        assert_eq!(OrderRef::parse("  RT-ABC123 ").unwrap().as_str(), "RT-ABC123");
    }

    #[test]
    fn test_order_ref_deserialization_rejects_garbage() {
        let ok: Result<OrderRef, _> = serde_json::from_str("\"RT-ABC123\"");
        assert!(ok.is_ok());
        let bad: Result<OrderRef, _> = serde_json::from_str("\"x\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_payment_transitions() {
        use PaymentStatus::*;
        assert_eq!(Pending.transition_to(Initiated), PaymentTransition::Applied);
        assert_eq!(Initiated.transition_to(Paid), PaymentTransition::Applied);
        assert_eq!(Pending.transition_to(Failed), PaymentTransition::Applied);
        assert_eq!(Failed.transition_to(Paid), PaymentTransition::Applied);
        assert_eq!(Paid.transition_to(Paid), PaymentTransition::AlreadyApplied);
        assert_eq!(Paid.transition_to(Failed), PaymentTransition::Ignored);
        assert_eq!(Paid.transition_to(Initiated), PaymentTransition::Ignored);
        assert_eq!(Initiated.transition_to(Pending), PaymentTransition::Ignored);
        assert_eq!(Failed.transition_to(Initiated), PaymentTransition::Ignored);
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut dup = request();
        dup.seats = vec!["12A".to_string(), "12a".to_string()];
        assert!(dup.validate().is_err());

        let mut empty = request();
        empty.seats.clear();
        assert!(empty.validate().is_err());

        let mut orphan_return = request();
        orphan_return.return_seats = vec!["3C".to_string()];
        assert!(orphan_return.validate().is_err());

        let mut bad_email = request();
        bad_email.contact.email = Masked::from("not-an-email");
        assert!(bad_email.validate().is_err());

        let mut stray_passenger = request();
        stray_passenger.passengers.push(PassengerDetail {
            full_name: "Ion Pop".to_string(),
            seat_label: "1A".to_string(),
            leg: Leg::Departure,
        });
        assert!(stray_passenger.validate().is_err());
    }

    #[test]
    fn test_request_deserialization_defaults() {
        let json = serde_json::json!({
            "trip_id": Uuid::nil(),
            "contact": {
                "full_name": "Ana Pop",
                "email": "ana@example.com",
                "phone": "0721000111"
            },
            "seats": ["1A"],
            "passengers": [{"full_name": "Ana Pop", "seat_label": "1A"}]
        });
        let req: BookingRequest = serde_json::from_value(json).unwrap();
        assert!(req.order_ref.is_none());
        assert!(req.return_seats.is_empty());
        assert_eq!(req.passengers[0].leg, Leg::Departure);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_add_on_totals_reject_overflow() {
        let bag = |price_cents| AddOn {
            code: "BAG".to_string(),
            description: "Extra luggage".to_string(),
            price_cents,
        };
        assert_eq!(AddOn::total(&[bag(1500), bag(500)]).unwrap(), 2000);
        assert!(matches!(
            AddOn::total(&[bag(i64::MAX), bag(1)]),
            Err(CoreError::ValidationError(_))
        ));
    }
}
