use async_trait::async_trait;
use busline_shared::Masked;
use serde::{Deserialize, Serialize};

use crate::booking::OrderRef;
use crate::CoreResult;

/// What the provider needs to open a hosted payment page for one booking.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_ref: OrderRef,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub customer_email: Masked<String>,
}

impl CheckoutRequest {
    /// Stable across retries so the provider never opens two sessions (or
    /// charges twice) for one order.
    pub fn idempotency_key(&self) -> String {
        format!("booking-{}", self.order_ref)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Provider-side view of a checkout session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderPaymentState {
    Open,
    Paid,
    Failed,
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a hosted checkout session with the provider
    async fn create_checkout(&self, request: &CheckoutRequest) -> CoreResult<CheckoutSession>;

    /// Retrieve the current state of a session
    async fn session_state(&self, session_id: &str) -> CoreResult<ProviderPaymentState>;
}
