use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    /// Failing fast until the cool-down has passed.
    Open,
    /// Letting trial calls through to see if the provider is back.
    HalfOpen,
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

/// Fails payment-provider calls fast after repeated errors.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    cool_down: Duration,
    inner: Mutex<Breaker>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: usize, cool_down: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: threshold.max(1),
            cool_down,
            inner: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn current(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Whether a call may go through right now. An open breaker whose
    /// cool-down has elapsed moves to half-open and admits the call.
    pub async fn check(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner.opened_at.is_some_and(|at| at.elapsed() > self.cool_down);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit breaker [{}] half-open, probing provider", self.name);
                }
                cooled
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker [{}] closed again", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;

        let trip = inner.state == CircuitState::HalfOpen || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            tracing::error!(
                "Circuit breaker [{}] open after {} consecutive failures",
                self.name,
                inner.consecutive_failures
            );
        }
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}
