pub mod changes;
pub mod idempotency;
pub mod memory;
pub mod orchestrator;
pub mod reference;
pub mod resiliency;
pub mod retry;
pub mod service;

pub use changes::{AddOnsRequest, ChangeHandler, RescheduleRequest};
pub use idempotency::{Admission, IdempotencyGate, Served};
pub use memory::InMemoryStore;
pub use orchestrator::{MockPaymentAdapter, PaymentOrchestrator};
pub use resiliency::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;
pub use service::{BookingService, Checkout, SaleChannel, ServiceConfig, SweepReport};
