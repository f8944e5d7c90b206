pub mod booking;
pub mod events;
pub mod payment;
pub mod repository;
pub mod schedule;
pub mod trip;

use uuid::Uuid;

/// Error taxonomy shared by every layer.
///
/// `Clone` because the idempotency gate hands the same failure to every
/// caller waiting on one order reference.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Order reference {0} already exists")]
    DuplicateOrderRef(String),
    #[error("Seats unavailable on trip {trip_id}: {}", seats.join(", "))]
    SeatUnavailable { trip_id: Uuid, seats: Vec<String> },
    #[error("Changes are not allowed within {min_hours} hours of departure ({hours_left}h left)")]
    ChangeWindowClosed { hours_left: i64, min_hours: i64 },
    #[error("Transient storage failure: {0}")]
    Transient(String),
    #[error("Payment provider error: {0}")]
    ExternalService(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Lock, serialization and timeout failures that a fresh attempt may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
