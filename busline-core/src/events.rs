use async_trait::async_trait;

use crate::CoreResult;

/// Outbound domain events (Kafka in production).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> CoreResult<()>;
}

/// Drops every event. Used when no broker is configured.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, topic: &str, key: &str, _payload: &str) -> CoreResult<()> {
        tracing::debug!("Event publishing disabled, dropping {} for {}", topic, key);
        Ok(())
    }
}
