use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use busline_core::booking::{OrderRef, PaymentStatus, PaymentTransition};
use busline_core::CoreError;
use busline_store::stripe::verify_signature;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/stripe", post(handle_stripe_webhook))
}

/// Payment outcome carried by a checkout session event, if any.
fn outcome(event: &StripeEvent) -> Option<PaymentStatus> {
    match event.type_.as_str() {
        "checkout.session.completed" => {
            let paid = event.data.object.get("payment_status").and_then(Value::as_str) == Some("paid");
            paid.then_some(PaymentStatus::Paid)
        }
        "checkout.session.async_payment_succeeded" => Some(PaymentStatus::Paid),
        "checkout.session.async_payment_failed" | "checkout.session.expired" => Some(PaymentStatus::Failed),
        _ => None,
    }
}

fn order_ref(object: &Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|m| m.get("order_ref"))
        .and_then(Value::as_str)
        .or_else(|| object.get("client_reference_id").and_then(Value::as_str))
}

/// POST /v1/webhooks/stripe
/// Stripe retries anything that is not 2xx, so only failures worth a retry
/// answer 500.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let webhooks = &state.metrics.webhooks;

    let Some(signature) = headers.get("Stripe-Signature").and_then(|h| h.to_str().ok()) else {
        webhooks.with_label_values(&["rejected"]).inc();
        return StatusCode::BAD_REQUEST;
    };
    if let Err(e) = verify_signature(
        &body,
        signature,
        &state.webhook.secret,
        state.webhook.tolerance_seconds,
        Utc::now().timestamp(),
    ) {
        tracing::warn!("Rejected webhook: {}", e);
        webhooks.with_label_values(&["rejected"]).inc();
        return StatusCode::BAD_REQUEST;
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Unreadable webhook payload: {}", e);
            webhooks.with_label_values(&["rejected"]).inc();
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(target) = outcome(&event) else {
        tracing::debug!("Ignoring webhook {} of type {}", event.id, event.type_);
        webhooks.with_label_values(&["ignored"]).inc();
        return StatusCode::OK;
    };
    let Some(reference) = order_ref(&event.data.object).and_then(|r| OrderRef::parse(r).ok()) else {
        tracing::warn!("Webhook {} carries no usable order reference", event.id);
        webhooks.with_label_values(&["ignored"]).inc();
        return StatusCode::OK;
    };

    tracing::info!("Received webhook {} ({}) for {}", event.id, event.type_, reference);

    match state.service.reconcile(&reference, target).await {
        Ok((_, PaymentTransition::Applied)) => {
            webhooks.with_label_values(&["applied"]).inc();
            state
                .metrics
                .payments_reconciled
                .with_label_values(&[target.as_str(), "webhook"])
                .inc();
            StatusCode::OK
        }
        Ok((_, PaymentTransition::AlreadyApplied)) => {
            webhooks.with_label_values(&["duplicate"]).inc();
            StatusCode::OK
        }
        Ok((_, PaymentTransition::Ignored)) => {
            webhooks.with_label_values(&["ignored"]).inc();
            StatusCode::OK
        }
        Err(CoreError::NotFound(_)) => {
            tracing::warn!("Webhook {} refers to unknown booking {}", event.id, reference);
            webhooks.with_label_values(&["ignored"]).inc();
            StatusCode::OK
        }
        Err(e) => {
            tracing::error!("Failed to reconcile {} from webhook {}: {}", reference, event.id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(type_: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({"id": "evt_1", "type": type_, "data": {"object": object}})).unwrap()
    }

    #[test]
    fn test_event_outcomes() {
        assert_eq!(
            outcome(&event("checkout.session.completed", json!({"payment_status": "paid"}))),
            Some(PaymentStatus::Paid)
        );
        assert_eq!(
            outcome(&event("checkout.session.completed", json!({"payment_status": "unpaid"}))),
            None
        );
        assert_eq!(
            outcome(&event("checkout.session.async_payment_succeeded", json!({}))),
            Some(PaymentStatus::Paid)
        );
        assert_eq!(
            outcome(&event("checkout.session.expired", json!({}))),
            Some(PaymentStatus::Failed)
        );
        assert_eq!(outcome(&event("charge.refunded", json!({}))), None);
    }

    #[test]
    fn test_order_ref_prefers_metadata() {
        let object = json!({"metadata": {"order_ref": "RT-META01"}, "client_reference_id": "RT-CLIENT1"});
        assert_eq!(order_ref(&object), Some("RT-META01"));
        assert_eq!(order_ref(&json!({"client_reference_id": "RT-CLIENT1"})), Some("RT-CLIENT1"));
        assert_eq!(order_ref(&json!({})), None);
    }
}
