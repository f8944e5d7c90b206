use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use busline_core::booking::Booking;
use busline_core::payment::{CheckoutRequest, CheckoutSession, PaymentAdapter, ProviderPaymentState};
use busline_core::{CoreError, CoreResult};

use crate::resiliency::CircuitBreaker;

/// Front door to the payment provider: builds checkout requests from
/// bookings and guards every call with a circuit breaker.
pub struct PaymentOrchestrator {
    adapter: Arc<dyn PaymentAdapter>,
    breaker: CircuitBreaker,
}

impl PaymentOrchestrator {
    pub fn new(adapter: Arc<dyn PaymentAdapter>, breaker: CircuitBreaker) -> Self {
        Self { adapter, breaker }
    }

    pub fn provider(&self) -> &'static str {
        self.adapter.name()
    }

    /// Opens (or, for a retried order, re-fetches) the hosted checkout.
    pub async fn open_checkout(&self, booking: &Booking) -> CoreResult<CheckoutSession> {
        let request = CheckoutRequest {
            order_ref: booking.order_ref.clone(),
            amount_cents: booking.total_cents,
            currency: booking.currency.clone(),
            description: format!("Bus ticket {} ({} seats)", booking.order_ref, booking.seat_count()),
            customer_email: booking.contact.email.clone(),
        };
        self.guarded(self.adapter.create_checkout(&request)).await
    }

    pub async fn session_state(&self, session_id: &str) -> CoreResult<ProviderPaymentState> {
        self.guarded(self.adapter.session_state(session_id)).await
    }

    async fn guarded<T>(&self, call: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        if !self.breaker.check().await {
            return Err(CoreError::ExternalService(format!(
                "{} is unavailable (circuit open)",
                self.adapter.name()
            )));
        }

        let result = call.await;
        match &result {
            Err(CoreError::ExternalService(e)) => {
                tracing::error!("Payment provider {} call failed: {}", self.adapter.name(), e);
                self.breaker.record_failure().await;
            }
            _ => self.breaker.record_success().await,
        }
        result
    }
}

/// In-process provider for development and tests. Sessions are keyed by the
/// idempotency key, like the real provider.
#[derive(Default)]
pub struct MockPaymentAdapter {
    sessions: Mutex<HashMap<String, (CheckoutSession, ProviderPaymentState)>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockPaymentAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the provider were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_state(&self, session_id: &str, state: ProviderPaymentState) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for (session, current) in sessions.values_mut() {
            if session.id == session_id {
                *current = state;
            }
        }
    }

    /// Distinct sessions ever opened.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Provider calls made, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> CoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::ExternalService("Simulated payment gateway failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentAdapter for MockPaymentAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> CoreResult<CheckoutSession> {
        self.check_up()?;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let (session, _) = sessions
            .entry(request.idempotency_key())
            .or_insert_with(|| {
                let id = format!("cs_mock_{}", request.order_ref);
                let session = CheckoutSession {
                    url: format!("https://checkout.mock/pay/{}", id),
                    id,
                };
                (session, ProviderPaymentState::Open)
            });
        Ok(session.clone())
    }

    async fn session_state(&self, session_id: &str) -> CoreResult<ProviderPaymentState> {
        self.check_up()?;

        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .find(|(session, _)| session.id == session_id)
            .map(|(_, state)| *state)
            .ok_or_else(|| CoreError::NotFound(format!("checkout session {}", session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busline_core::booking::OrderRef;
    use busline_shared::Masked;
    use std::time::Duration;

    fn request(order_ref: &str) -> CheckoutRequest {
        CheckoutRequest {
            order_ref: OrderRef::parse(order_ref).unwrap(),
            amount_cents: 24000,
            currency: "RON".to_string(),
            description: "test".to_string(),
            customer_email: Masked::from("ana@example.com"),
        }
    }

    #[tokio::test]
    async fn test_mock_reuses_session_per_order() {
        let adapter = MockPaymentAdapter::new();
        let first = adapter.create_checkout(&request("RT-ABC123")).await.unwrap();
        let again = adapter.create_checkout(&request("RT-ABC123")).await.unwrap();
        let other = adapter.create_checkout(&request("RT-XYZ789")).await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first.id, other.id);
        assert_eq!(adapter.session_count(), 2);
        assert_eq!(adapter.calls(), 3);

        adapter.set_state(&first.id, ProviderPaymentState::Paid);
        assert_eq!(adapter.session_state(&first.id).await.unwrap(), ProviderPaymentState::Paid);
        assert_eq!(adapter.session_state(&other.id).await.unwrap(), ProviderPaymentState::Open);
    }

    #[tokio::test]
    async fn test_breaker_fails_fast_after_provider_errors() {
        let adapter = Arc::new(MockPaymentAdapter::new());
        adapter.set_failing(true);
        let orchestrator = PaymentOrchestrator::new(
            adapter.clone(),
            CircuitBreaker::new("payments", 2, Duration::from_secs(60)),
        );

        for _ in 0..2 {
            assert!(orchestrator.session_state("cs_1").await.is_err());
        }
        let calls_before = adapter.calls();
        let err = orchestrator.session_state("cs_1").await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
        assert_eq!(adapter.calls(), calls_before);
    }
}
