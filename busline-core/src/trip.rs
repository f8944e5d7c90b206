use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::Leg;
use crate::{CoreError, CoreResult};

/// A scheduled departure operated by one bus of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trip {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    pub arrival_at: DateTime<Utc>,
    pub bus_label: String,
    pub total_seats: i32,
    pub fare_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTrip {
    pub origin: String,
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    pub arrival_at: DateTime<Utc>,
    pub bus_label: String,
    pub total_seats: i32,
    pub fare_cents: i64,
    /// Filled from the configured default when omitted.
    #[serde(default)]
    pub currency: String,
}

impl NewTrip {
    pub fn validate(&self) -> CoreResult<()> {
        if self.origin.trim().is_empty() || self.destination.trim().is_empty() {
            return Err(CoreError::ValidationError("origin and destination are required".to_string()));
        }
        if self.origin.trim().eq_ignore_ascii_case(self.destination.trim()) {
            return Err(CoreError::ValidationError("origin and destination must differ".to_string()));
        }
        if self.arrival_at <= self.departure_at {
            return Err(CoreError::ValidationError("arrival must be after departure".to_string()));
        }
        if self.total_seats <= 0 || self.total_seats > 120 {
            return Err(CoreError::ValidationError("total_seats must be between 1 and 120".to_string()));
        }
        if self.fare_cents < 0 {
            return Err(CoreError::ValidationError("fare_cents cannot be negative".to_string()));
        }
        if self.currency.len() != 3 {
            return Err(CoreError::ValidationError("currency must be an ISO 4217 code".to_string()));
        }
        Ok(())
    }

    pub fn into_trip(self, id: Uuid) -> Trip {
        Trip {
            id,
            origin: self.origin.trim().to_string(),
            destination: self.destination.trim().to_string(),
            departure_at: self.departure_at,
            arrival_at: self.arrival_at,
            bus_label: self.bus_label,
            total_seats: self.total_seats,
            fare_cents: self.fare_cents,
            currency: self.currency.to_ascii_uppercase(),
        }
    }
}

/// A round trip's return leg must leave after its outbound leg.
pub fn ensure_return_after(outbound_departure: DateTime<Utc>, return_departure: DateTime<Utc>) -> CoreResult<()> {
    if return_departure <= outbound_departure {
        return Err(CoreError::ValidationError(
            "return trip must depart after the outbound trip".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripSearch {
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    #[serde(default = "default_seats")]
    pub seats: u32,
}

fn default_seats() -> u32 {
    1
}

/// Trip with seat availability recomputed from passenger rows.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TripAvailability {
    #[serde(flatten)]
    pub trip: Trip,
    pub occupied_seats: i64,
    pub available_seats: i64,
}

impl TripAvailability {
    pub fn new(trip: Trip, occupied_seats: i64) -> Self {
        let available_seats = (trip.total_seats as i64 - occupied_seats).max(0);
        Self {
            trip,
            occupied_seats,
            available_seats,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccupiedSeat {
    pub seat_label: String,
    pub leg: Leg,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeatMap {
    pub trip_id: Uuid,
    pub total_seats: i32,
    pub occupied: Vec<OccupiedSeat>,
    pub available_seats: i64,
}

impl SeatMap {
    pub fn new(trip: &Trip, mut occupied: Vec<OccupiedSeat>) -> Self {
        occupied.sort_by(|a, b| a.seat_label.cmp(&b.seat_label));
        let available_seats = (trip.total_seats as i64 - occupied.len() as i64).max(0);
        Self {
            trip_id: trip.id,
            total_seats: trip.total_seats,
            occupied,
            available_seats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_trip() -> NewTrip {
        let departure = Utc::now() + Duration::days(3);
        NewTrip {
            origin: "Cluj".to_string(),
            destination: "Bucharest".to_string(),
            departure_at: departure,
            arrival_at: departure + Duration::hours(8),
            bus_label: "CJ-01-BUS".to_string(),
            total_seats: 48,
            fare_cents: 12000,
            currency: "ron".to_string(),
        }
    }

    #[test]
    fn test_new_trip_validation() {
        assert!(new_trip().validate().is_ok());

        let mut backwards = new_trip();
        backwards.arrival_at = backwards.departure_at - Duration::hours(1);
        assert!(backwards.validate().is_err());

        let mut no_seats = new_trip();
        no_seats.total_seats = 0;
        assert!(no_seats.validate().is_err());

        let mut loop_route = new_trip();
        loop_route.destination = "cluj".to_string();
        assert!(loop_route.validate().is_err());
    }

    #[test]
    fn test_availability_is_derived() {
        let trip = new_trip().into_trip(Uuid::new_v4());
        assert_eq!(trip.currency, "RON");
        let availability = TripAvailability::new(trip.clone(), 46);
        assert_eq!(availability.available_seats, 2);

        let map = SeatMap::new(
            &trip,
            vec![
                OccupiedSeat { seat_label: "2B".into(), leg: Leg::Departure },
                OccupiedSeat { seat_label: "1A".into(), leg: Leg::Return },
            ],
        );
        assert_eq!(map.available_seats, 46);
        assert_eq!(map.occupied[0].seat_label, "1A");
    }

    #[test]
    fn test_return_must_follow_outbound() {
        let outbound = Utc::now() + Duration::days(1);
        assert!(ensure_return_after(outbound, outbound + Duration::hours(1)).is_ok());
        assert!(ensure_return_after(outbound, outbound).is_err());
        assert!(ensure_return_after(outbound, outbound - Duration::hours(1)).is_err());
    }
}
