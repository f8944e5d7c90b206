use busline_core::booking::AddOn;
use busline_core::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Deserialize;

const MAX_ADD_ONS_PER_REQUEST: usize = 10;
const MAX_ADD_ON_PRICE_CENTS: i64 = 1_000_000;

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleRequest {
    pub departure_date: NaiveDate,
    pub departure_time: NaiveTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddOnsRequest {
    pub add_ons: Vec<AddOn>,
}

/// Validates post-booking modifications before they reach storage.
pub struct ChangeHandler;

impl ChangeHandler {
    /// New departure (UTC) for a reschedule; must lie in the future.
    pub fn new_departure(req: &RescheduleRequest, now: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        let departure = Utc.from_utc_datetime(&req.departure_date.and_time(req.departure_time));
        if departure <= now {
            return Err(CoreError::ValidationError(
                "new departure must be in the future".to_string(),
            ));
        }
        Ok(departure)
    }

    pub fn validate_add_ons(add_ons: &[AddOn]) -> CoreResult<()> {
        if add_ons.is_empty() {
            return Err(CoreError::ValidationError("no add-ons given".to_string()));
        }
        if add_ons.len() > MAX_ADD_ONS_PER_REQUEST {
            return Err(CoreError::ValidationError(format!(
                "at most {} add-ons per request",
                MAX_ADD_ONS_PER_REQUEST
            )));
        }
        for add_on in add_ons {
            if add_on.code.trim().is_empty() {
                return Err(CoreError::ValidationError("add-on code is required".to_string()));
            }
            if add_on.price_cents < 0 {
                return Err(CoreError::ValidationError(format!(
                    "add-on {} has a negative price",
                    add_on.code
                )));
            }
            if add_on.price_cents > MAX_ADD_ON_PRICE_CENTS {
                return Err(CoreError::ValidationError(format!(
                    "add-on {} costs more than {}",
                    add_on.code, MAX_ADD_ON_PRICE_CENTS
                )));
            }
        }
        Ok(())
    }

    pub fn add_ons_total(add_ons: &[AddOn]) -> CoreResult<i64> {
        AddOn::total(add_ons)
    }
}
