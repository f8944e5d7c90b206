//! Stripe hosted checkout and webhook signatures.

use async_trait::async_trait;
use busline_core::payment::{CheckoutRequest, CheckoutSession, PaymentAdapter, ProviderPaymentState};
use busline_core::{CoreError, CoreResult};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use crate::app_config::PaymentsConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct StripeAdapter {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
    success_url: String,
    cancel_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    id: String,
    url: Option<String>,
    status: Option<String>,
    payment_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl StripeAdapter {
    pub fn new(config: &PaymentsConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
        })
    }

    async fn read_session(&self, response: reqwest::Response) -> CoreResult<SessionBody> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| status.to_string());
            return Err(CoreError::ExternalService(format!("stripe returned {}: {}", status, message)));
        }
        response
            .json::<SessionBody>()
            .await
            .map_err(|e| CoreError::ExternalService(format!("unreadable stripe response: {}", e)))
    }
}

fn with_order_ref(template: &str, order_ref: &str) -> String {
    template.replace("{ORDER_REF}", order_ref)
}

/// Maps a checkout session's `status`/`payment_status` pair.
fn session_state(status: Option<&str>, payment_status: Option<&str>) -> ProviderPaymentState {
    match (status, payment_status) {
        (_, Some("paid")) | (_, Some("no_payment_required")) => ProviderPaymentState::Paid,
        (Some("expired"), _) => ProviderPaymentState::Failed,
        _ => ProviderPaymentState::Open,
    }
}

#[async_trait]
impl PaymentAdapter for StripeAdapter {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> CoreResult<CheckoutSession> {
        let order_ref = request.order_ref.as_str();
        let amount = request.amount_cents.to_string();
        let currency = request.currency.to_ascii_lowercase();
        let success_url = with_order_ref(&self.success_url, order_ref);
        let cancel_url = with_order_ref(&self.cancel_url, order_ref);

        let form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("client_reference_id", order_ref),
            ("metadata[order_ref]", order_ref),
            ("customer_email", request.customer_email.expose().as_str()),
            ("success_url", success_url.as_str()),
            ("cancel_url", cancel_url.as_str()),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", currency.as_str()),
            ("line_items[0][price_data][unit_amount]", amount.as_str()),
            ("line_items[0][price_data][product_data][name]", request.description.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", request.idempotency_key())
            .form(&form)
            .send()
            .await
            .map_err(|e| CoreError::ExternalService(format!("stripe unreachable: {}", e)))?;

        let session = self.read_session(response).await?;
        let url = session
            .url
            .ok_or_else(|| CoreError::ExternalService(format!("session {} has no url", session.id)))?;
        tracing::info!("Stripe checkout {} opened for {}", session.id, order_ref);
        Ok(CheckoutSession { id: session.id, url })
    }

    async fn session_state(&self, session_id: &str) -> CoreResult<ProviderPaymentState> {
        let response = self
            .http
            .get(format!("{}/v1/checkout/sessions/{}", self.api_base, session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| CoreError::ExternalService(format!("stripe unreachable: {}", e)))?;

        let session = self.read_session(response).await?;
        Ok(session_state(session.status.as_deref(), session.payment_status.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Stale,
    #[error("no matching signature")]
    Mismatch,
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>,...`) against the
/// raw request body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > tolerance_seconds {
        return Err(SignatureError::Stale);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // constant-time comparison
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// Builds a header value the way Stripe does; used by tests and local tooling.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
