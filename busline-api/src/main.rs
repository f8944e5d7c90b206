use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use busline_api::{
    app,
    metrics::Metrics,
    state::{service_config, AppState, AuthConfig, WebhookConfig},
    worker::start_payment_sweeper,
};
use busline_booking::{BookingService, CircuitBreaker, MockPaymentAdapter, PaymentOrchestrator};
use busline_core::events::{EventPublisher, NoopPublisher};
use busline_core::payment::PaymentAdapter;
use busline_store::app_config::{Config, PaymentProvider};
use busline_store::{
    DbClient, EventProducer, PostgresBookingRepository, PostgresTripRepository, RedisClient, StripeAdapter,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "busline_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Busline API on port {}", config.server.port);

    // Database
    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let rules = match db.fetch_business_rules(config.business_rules.clone()).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!("Using file business rules, table unreadable: {}", e);
            config.business_rules.clone()
        }
    };

    let trips = Arc::new(PostgresTripRepository::new(db.pool.clone()));
    let bookings = Arc::new(PostgresBookingRepository::new(db.pool.clone(), &config.database));

    // Kafka
    let events: Arc<dyn EventPublisher> = if config.kafka.brokers.is_empty() {
        tracing::warn!("No Kafka brokers configured, events are dropped");
        Arc::new(NoopPublisher)
    } else {
        match EventProducer::new(&config.kafka.brokers) {
            Ok(producer) => Arc::new(producer),
            Err(e) => {
                tracing::warn!("Kafka producer unavailable, events are dropped: {}", e);
                Arc::new(NoopPublisher)
            }
        }
    };

    // Redis (rate limiting only)
    let redis = if config.redis.url.is_empty() {
        None
    } else {
        match RedisClient::new(&config.redis.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        }
    };

    // Payments
    let adapter: Arc<dyn PaymentAdapter> = match config.payments.provider {
        PaymentProvider::Stripe => {
            Arc::new(StripeAdapter::new(&config.payments).context("Failed to build Stripe client")?)
        }
        PaymentProvider::Mock => {
            tracing::warn!("Using mock payment provider");
            Arc::new(MockPaymentAdapter::new())
        }
    };
    let breaker = CircuitBreaker::new(adapter.name(), 5, Duration::from_secs(30));
    let payments = Arc::new(PaymentOrchestrator::new(adapter, breaker));

    let service = Arc::new(
        BookingService::new(
            bookings.clone(),
            trips.clone(),
            payments,
            events,
            service_config(&rules),
        )
        .context("Invalid business rules")?,
    );

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    tokio::spawn(start_payment_sweeper(
        service.clone(),
        Duration::from_secs(rules.sweep_interval_seconds.max(1)),
        metrics.payments_reconciled.clone(),
    ));

    let app_state = AppState {
        service,
        trips,
        bookings,
        redis,
        metrics,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        webhook: WebhookConfig {
            secret: config.payments.webhook_secret.clone(),
            tolerance_seconds: config.payments.webhook_tolerance_seconds,
        },
        rate_limit_per_minute: config.server.rate_limit_per_minute,
        default_currency: config.payments.currency.clone(),
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
