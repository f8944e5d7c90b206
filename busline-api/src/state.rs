use std::sync::Arc;
use std::time::Duration;

use busline_booking::{BookingService, RetryPolicy, ServiceConfig};
use busline_catalog::PricingConfig;
use busline_core::repository::{BookingRepository, TripRepository};
use busline_store::app_config::BusinessRules;
use busline_store::RedisClient;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_seconds: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BookingService>,
    pub trips: Arc<dyn TripRepository>,
    pub bookings: Arc<dyn BookingRepository>,
    /// Rate limiting is off without Redis.
    pub redis: Option<Arc<RedisClient>>,
    pub metrics: Arc<Metrics>,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub rate_limit_per_minute: i64,
    pub default_currency: String,
}

pub fn service_config(rules: &BusinessRules) -> ServiceConfig {
    ServiceConfig {
        change_window_hours: rules.change_window_hours,
        idempotency_retention: Duration::from_secs(rules.idempotency_retention_seconds),
        idempotency_capacity: rules.idempotency_capacity,
        retry: RetryPolicy::new(rules.retry_attempts, Duration::from_millis(rules.retry_backoff_ms)),
        pricing: PricingConfig {
            agent_discount_percent: rules.agent_discount_percent,
        },
        stale_after: Duration::from_secs(rules.stale_after_seconds),
        ..ServiceConfig::default()
    }
}
