use chrono::{DateTime, Duration, Utc};

use crate::{CoreError, CoreResult};

/// "No changes within N hours of departure."
#[derive(Debug, Clone, Copy)]
pub struct ChangePolicy {
    pub now: DateTime<Utc>,
    pub min_hours: i64,
}

impl ChangePolicy {
    pub fn new(now: DateTime<Utc>, min_hours: i64) -> Self {
        Self { now, min_hours }
    }

    /// Fails with `ChangeWindowClosed` unless `departure_at` is at least
    /// `min_hours` away.
    pub fn ensure_open(&self, departure_at: DateTime<Utc>) -> CoreResult<()> {
        let remaining = departure_at - self.now;
        if remaining < Duration::hours(self.min_hours) {
            return Err(CoreError::ChangeWindowClosed {
                hours_left: remaining.num_hours().max(0),
                min_hours: self.min_hours,
            });
        }
        Ok(())
    }
}
