use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use busline_api::{
    app,
    metrics::Metrics,
    state::{AppState, AuthConfig, WebhookConfig},
};
use busline_booking::{
    BookingService, CircuitBreaker, InMemoryStore, MockPaymentAdapter, PaymentOrchestrator, ServiceConfig,
};
use busline_core::events::NoopPublisher;
use busline_core::repository::TripRepository;
use busline_core::trip::{NewTrip, Trip};
use busline_store::stripe::sign_payload;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const JWT_SECRET: &str = "test-jwt-secret";
const WEBHOOK_SECRET: &str = "whsec_test";

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
}

fn test_app() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let adapter = Arc::new(MockPaymentAdapter::new());
    let payments = Arc::new(PaymentOrchestrator::new(
        adapter,
        CircuitBreaker::new("mock", 5, std::time::Duration::from_secs(30)),
    ));
    let service = BookingService::new(
        store.clone(),
        store.clone(),
        payments,
        Arc::new(NoopPublisher),
        ServiceConfig::default(),
    )
    .unwrap();

    let state = AppState {
        service: Arc::new(service),
        trips: store.clone(),
        bookings: store.clone(),
        redis: None,
        metrics: Arc::new(Metrics::new().unwrap()),
        auth: AuthConfig {
            secret: JWT_SECRET.to_string(),
        },
        webhook: WebhookConfig {
            secret: WEBHOOK_SECRET.to_string(),
            tolerance_seconds: 300,
        },
        rate_limit_per_minute: 120,
        default_currency: "RON".to_string(),
    };

    TestApp {
        router: app(state),
        store,
    }
}

async fn seed_trip(store: &InMemoryStore, hours_ahead: i64) -> Trip {
    let departure = Utc::now() + Duration::hours(hours_ahead);
    store
        .create_trip(NewTrip {
            origin: "Cluj".to_string(),
            destination: "Bucharest".to_string(),
            departure_at: departure,
            arrival_at: departure + Duration::hours(8),
            bus_label: "CJ-01-BUS".to_string(),
            total_seats: 40,
            fare_cents: 2499,
            currency: "RON".to_string(),
        })
        .await
        .unwrap()
}

fn token(role: &str) -> String {
    let claims = json!({
        "sub": format!("{}-1", role.to_lowercase()),
        "email": "ops@busline.test",
        "agency": "Nord Travel",
        "role": role,
        "exp": Utc::now().timestamp() + 600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

fn booking_body(order_ref: &str, trip_id: Uuid, seats: &[&str]) -> Value {
    json!({
        "order_ref": order_ref,
        "trip_id": trip_id,
        "contact": {
            "full_name": "Ana Pop",
            "email": "ana@example.com",
            "phone": "+40 721 000 111"
        },
        "seats": seats,
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: &Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn webhook(payload: &Value, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/webhooks/stripe")
        .header("Stripe-Signature", signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let response = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_then_replay_booking() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;
    let body = booking_body("RT-ABC123", trip.id, &["12A", "12B"]);

    let (status, first) = send(&app.router, post_json("/v1/bookings", &body, None)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["replayed"], false);
    assert_eq!(first["booking"]["payment_status"], "initiated");
    assert_eq!(first["booking"]["total_cents"], 4998);
    assert!(first["redirect_url"].as_str().unwrap().contains("RT-ABC123"));

    let (status, second) = send(&app.router, post_json("/v1/bookings", &body, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["replayed"], true);
    assert_eq!(second["booking"]["id"], first["booking"]["id"]);
    assert_eq!(second["redirect_url"], first["redirect_url"]);
    assert_eq!(app.store.booking_count().await, 1);

    let (status, fetched) = send(&app.router, get("/v1/bookings/RT-ABC123")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["order_ref"], "RT-ABC123");
}

#[tokio::test]
async fn test_taken_seat_is_conflict() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;

    let (status, _) = send(
        &app.router,
        post_json("/v1/bookings", &booking_body("RT-FIRST1", trip.id, &["3C"]), None),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app.router,
        post_json("/v1/bookings", &booking_body("RT-SECOND", trip.id, &["3c", "4C"]), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("3C"));

    let (_, seats) = send(&app.router, get(&format!("/v1/trips/{}/seats", trip.id))).await;
    assert_eq!(seats["available_seats"], 39);
}

#[tokio::test]
async fn test_invalid_request_is_bad_request() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;
    let mut body = booking_body("RT-BADMAIL", trip.id, &["1A"]);
    body["contact"]["email"] = json!("not-an-email");

    let (status, body) = send(&app.router, post_json("/v1/bookings", &body, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("email"));

    let (status, _) = send(&app.router, get("/v1/bookings/RT-MISSING")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_sale_is_discounted() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;

    let (status, body) = send(
        &app.router,
        post_json(
            "/v1/bookings",
            &booking_body("RT-AGENT1", trip.id, &["7A"]),
            Some(&token("AGENT")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["booking"]["total_cents"], 2249);
    assert_eq!(body["booking"]["commission_cents"], 250);
    assert_eq!(body["booking"]["agent_id"], "agent-1");

    let (status, _) = send(
        &app.router,
        post_json(
            "/v1/bookings",
            &booking_body("RT-AGENT2", trip.id, &["7B"]),
            Some("not-a-jwt"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_signed_webhook_marks_paid_once() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;
    let (status, _) = send(
        &app.router,
        post_json("/v1/bookings", &booking_body("RT-PAY001", trip.id, &["1A"]), None),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let payload = json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": "cs_mock_RT-PAY001",
            "payment_status": "paid",
            "metadata": {"order_ref": "RT-PAY001"}
        }}
    });
    let signature = sign_payload(payload.to_string().as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp());

    for _ in 0..2 {
        let response = app.router.clone().oneshot(webhook(&payload, &signature)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let (_, booking) = send(&app.router, get("/v1/bookings/RT-PAY001")).await;
    assert_eq!(booking["payment_status"], "paid");

    let (_, metrics) = {
        let response = app.router.clone().oneshot(get("/metrics")).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (StatusCode::OK, String::from_utf8(bytes.to_vec()).unwrap())
    };
    assert!(metrics.contains("busline_payment_webhooks_total{result=\"applied\"} 1"));
    assert!(metrics.contains("busline_payment_webhooks_total{result=\"duplicate\"} 1"));
}

#[tokio::test]
async fn test_webhook_signature_required() {
    let app = test_app();
    let payload = json!({"id": "evt_2", "type": "checkout.session.expired", "data": {"object": {}}});

    let forged = sign_payload(payload.to_string().as_bytes(), "whsec_other", Utc::now().timestamp());
    let response = app.router.clone().oneshot(webhook(&payload, &forged)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unknown_order = json!({
        "id": "evt_3",
        "type": "checkout.session.expired",
        "data": {"object": {"client_reference_id": "RT-NOSUCH"}}
    });
    let signature = sign_payload(unknown_order.to_string().as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp());
    let response = app.router.clone().oneshot(webhook(&unknown_order, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = test_app();
    let trip = json!({
        "origin": "Iasi",
        "destination": "Brasov",
        "departure_at": (Utc::now() + Duration::days(5)).to_rfc3339(),
        "arrival_at": (Utc::now() + Duration::days(5) + Duration::hours(7)).to_rfc3339(),
        "bus_label": "IS-22-BUS",
        "total_seats": 50,
        "fare_cents": 9000
    });

    let (status, _) = send(&app.router, post_json("/v1/admin/trips", &trip, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, post_json("/v1/admin/trips", &trip, Some(&token("AGENT")))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, created) = send(&app.router, post_json("/v1/admin/trips", &trip, Some(&token("ADMIN")))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["currency"], "RON");
}

#[tokio::test]
async fn test_admin_cancel_frees_seats() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;
    send(
        &app.router,
        post_json("/v1/bookings", &booking_body("RT-CANCEL", trip.id, &["9A", "9B"]), None),
    )
    .await;

    let admin = token("SUPER_ADMIN");
    for _ in 0..2 {
        let (status, booking) = send(
            &app.router,
            post_json("/v1/admin/bookings/RT-CANCEL/cancel", &json!({}), Some(&admin)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["booking_status"], "cancelled");
    }

    let request = Request::builder()
        .uri(format!("/v1/admin/trips/{}/bookings", trip.id))
        .header(header::AUTHORIZATION, format!("Bearer {}", admin))
        .body(Body::empty())
        .unwrap();
    let (status, bookings) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bookings.as_array().unwrap().len(), 1);

    let (_, seats) = send(&app.router, get(&format!("/v1/trips/{}/seats", trip.id))).await;
    assert_eq!(seats["available_seats"], 40);
}

#[tokio::test]
async fn test_reschedule_inside_change_window_rejected() {
    let app = test_app();
    let trip = seed_trip(&app.store, 23).await;
    send(
        &app.router,
        post_json("/v1/bookings", &booking_body("RT-LATE01", trip.id, &["2A"]), None),
    )
    .await;

    let target = Utc::now() + Duration::days(5);
    let body = json!({
        "departure_date": target.format("%Y-%m-%d").to_string(),
        "departure_time": "10:30:00"
    });
    let (status, error) = send(&app.router, post_json("/v1/bookings/RT-LATE01/reschedule", &body, None)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["error"].as_str().unwrap().contains("24 hours"));

    let add_ons = json!({"add_ons": [{"code": "bag", "description": "Extra bag", "price_cents": 1500}]});
    let (status, _) = send(&app.router, post_json("/v1/bookings/RT-LATE01/add-ons", &add_ons, None)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_search_lists_available_trips() {
    let app = test_app();
    let trip = seed_trip(&app.store, 72).await;
    let date = trip.departure_at.format("%Y-%m-%d");

    let (status, body) = send(
        &app.router,
        get(&format!("/v1/trips/search?origin=cluj&destination=Bucharest&date={}&seats=2", date)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let trips = body.as_array().unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0]["available_seats"], 40);

    let (status, _) = send(&app.router, get(&format!("/v1/trips/{}/seats", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
