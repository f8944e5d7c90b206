use busline_core::CoreError;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

use crate::app_config::{BusinessRules, DatabaseConfig};

pub const ORDER_REF_CONSTRAINT: &str = "bookings_order_ref_key";
pub const ACTIVE_SEAT_CONSTRAINT: &str = "passengers_active_seat_key";

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Overlays rows of the `business_rules` table on the file defaults.
    /// Rows are `{"value": <number>}` keyed by field name.
    pub async fn fetch_business_rules(&self, defaults: BusinessRules) -> Result<BusinessRules, sqlx::Error> {
        let rows: Vec<(String, Value)> = sqlx::query_as("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        Ok(apply_rule_overrides(defaults, rows))
    }
}

pub fn apply_rule_overrides(defaults: BusinessRules, rows: Vec<(String, Value)>) -> BusinessRules {
    let mut rules = defaults;

    for (key, value) in rows {
        let Some(v) = value.get("value").and_then(Value::as_i64) else {
            tracing::warn!("Ignoring business rule {} with non-numeric value", key);
            continue;
        };
        if v < 0 {
            tracing::warn!("Ignoring negative business rule {} = {}", key, v);
            continue;
        }
        match key.as_str() {
            "change_window_hours" => rules.change_window_hours = v,
            "agent_discount_percent" if v < 100 => rules.agent_discount_percent = v,
            "idempotency_retention_seconds" => rules.idempotency_retention_seconds = v as u64,
            "idempotency_capacity" if v > 0 => rules.idempotency_capacity = v as usize,
            "retry_attempts" if v > 0 => rules.retry_attempts = v as u32,
            "retry_backoff_ms" => rules.retry_backoff_ms = v as u64,
            "sweep_interval_seconds" if v > 0 => rules.sweep_interval_seconds = v as u64,
            "stale_after_seconds" => rules.stale_after_seconds = v as u64,
            other => tracing::warn!("Unknown or out-of-range business rule {} = {}", other, v),
        }
    }

    rules
}

/// Maps driver failures onto the domain taxonomy. Lock waits, serialization
/// failures, deadlocks, timeouts and pool exhaustion are retryable.
pub fn map_db_error(e: sqlx::Error) -> CoreError {
    match &e {
        sqlx::Error::PoolTimedOut => CoreError::Transient("connection pool timed out".to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "40001" | "40P01" | "55P03" | "57014" => {
                    CoreError::Transient(format!("{} ({})", db.message(), code))
                }
                "23505" if db.constraint() == Some(ORDER_REF_CONSTRAINT) => {
                    CoreError::DuplicateOrderRef(db.message().to_string())
                }
                "23505" => CoreError::Conflict(db.message().to_string()),
                _ => CoreError::InternalError(e.to_string()),
            }
        }
        _ => CoreError::InternalError(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> BusinessRules {
        BusinessRules {
            change_window_hours: 24,
            agent_discount_percent: 10,
            idempotency_retention_seconds: 900,
            idempotency_capacity: 10_000,
            retry_attempts: 3,
            retry_backoff_ms: 100,
            sweep_interval_seconds: 60,
            stale_after_seconds: 1800,
        }
    }

    #[test]
    fn test_rule_overrides() {
        let rules = apply_rule_overrides(
            defaults(),
            vec![
                ("change_window_hours".to_string(), json!({"value": 48})),
                ("agent_discount_percent".to_string(), json!({"value": 150})),
                ("retry_attempts".to_string(), json!({"value": "five"})),
                ("mystery".to_string(), json!({"value": 1})),
            ],
        );
        assert_eq!(rules.change_window_hours, 48);
        assert_eq!(rules.agent_discount_percent, 10);
        assert_eq!(rules.retry_attempts, 3);
    }

    #[test]
    fn test_capacity_and_sweep_interval_overrides() {
        let rules = apply_rule_overrides(
            defaults(),
            vec![
                ("idempotency_capacity".to_string(), json!({"value": 500})),
                ("sweep_interval_seconds".to_string(), json!({"value": 120})),
            ],
        );
        assert_eq!(rules.idempotency_capacity, 500);
        assert_eq!(rules.sweep_interval_seconds, 120);

        let zeroed = apply_rule_overrides(
            defaults(),
            vec![
                ("idempotency_capacity".to_string(), json!({"value": 0})),
                ("sweep_interval_seconds".to_string(), json!({"value": 0})),
            ],
        );
        assert_eq!(zeroed.idempotency_capacity, 10_000);
        assert_eq!(zeroed.sweep_interval_seconds, 60);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(map_db_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!map_db_error(sqlx::Error::RowNotFound).is_transient());
    }
}
