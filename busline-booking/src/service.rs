use std::sync::Arc;
use std::time::Duration;

use busline_catalog::{FareLeg, PricingConfig, PricingEngine};
use busline_core::booking::{
    normalize_seat, AddOn, Booking, BookingDraft, BookingRequest, BookingStatus, Leg, OrderRef,
    PassengerDetail, PaymentStatus, PaymentTransition,
};
use busline_core::events::EventPublisher;
use busline_core::payment::ProviderPaymentState;
use busline_core::repository::{BookingCreation, BookingRepository, Rescheduled, TripRepository};
use busline_core::schedule::ChangePolicy;
use busline_core::trip::{ensure_return_after, Trip};
use busline_core::{CoreError, CoreResult};
use busline_shared::models::events::{
    BookingCancelledEvent, BookingCreatedEvent, BookingRescheduledEvent, PaymentSettledEvent,
    TOPIC_BOOKING_CANCELLED, TOPIC_BOOKING_CREATED, TOPIC_BOOKING_PAID,
    TOPIC_BOOKING_PAYMENT_FAILED, TOPIC_BOOKING_RESCHEDULED,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::changes::{AddOnsRequest, ChangeHandler, RescheduleRequest};
use crate::idempotency::{IdempotencyGate, Served};
use crate::orchestrator::PaymentOrchestrator;
use crate::reference::generate_order_ref;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub change_window_hours: i64,
    pub idempotency_retention: Duration,
    pub idempotency_capacity: usize,
    pub retry: RetryPolicy,
    pub pricing: PricingConfig,
    /// How long a booking may sit in `initiated` before the sweeper asks
    /// the provider about it.
    pub stale_after: Duration,
    pub sweep_batch: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            change_window_hours: 24,
            idempotency_retention: Duration::from_secs(15 * 60),
            idempotency_capacity: 10_000,
            retry: RetryPolicy::default(),
            pricing: PricingConfig::default(),
            stale_after: Duration::from_secs(30 * 60),
            sweep_batch: 50,
        }
    }
}

/// Who is selling: agents get the discount and earn commission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleChannel {
    Direct,
    Agent { agent_id: String },
}

/// Result of a booking submission.
#[derive(Debug, Clone, Serialize)]
pub struct Checkout {
    pub booking: Booking,
    /// Hosted payment page; absent once the booking is already paid.
    pub redirect_url: Option<String>,
    /// The order reference had already been processed.
    pub replayed: bool,
}

/// Outcomes applied by one sweeper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub paid: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn settled(&self) -> usize {
        self.paid + self.failed
    }
}

pub struct BookingService {
    bookings: Arc<dyn BookingRepository>,
    trips: Arc<dyn TripRepository>,
    payments: Arc<PaymentOrchestrator>,
    events: Arc<dyn EventPublisher>,
    gate: IdempotencyGate<OrderRef, BookingCreation, CoreError>,
    pricing: PricingEngine,
    next_ref: Box<dyn Fn() -> CoreResult<OrderRef> + Send + Sync>,
    config: ServiceConfig,
}

impl BookingService {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        trips: Arc<dyn TripRepository>,
        payments: Arc<PaymentOrchestrator>,
        events: Arc<dyn EventPublisher>,
        config: ServiceConfig,
    ) -> CoreResult<Self> {
        let pricing = PricingEngine::new(config.pricing.clone())
            .map_err(|e| CoreError::ValidationError(e.to_string()))?;
        Ok(Self {
            bookings,
            trips,
            payments,
            events,
            gate: IdempotencyGate::new(config.idempotency_retention, config.idempotency_capacity),
            pricing,
            next_ref: Box::new(generate_order_ref),
            config,
        })
    }

    /// Replaces the source of server-drawn order references.
    pub fn with_reference_source(
        mut self,
        source: impl Fn() -> CoreResult<OrderRef> + Send + Sync + 'static,
    ) -> Self {
        self.next_ref = Box::new(source);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Creates the booking at most once per order reference, then opens the
    /// hosted checkout outside the transaction.
    pub async fn create_booking(
        &self,
        request: BookingRequest,
        channel: SaleChannel,
    ) -> CoreResult<Checkout> {
        request.validate()?;
        let generated = request.order_ref.is_none();
        let order_ref = match &request.order_ref {
            Some(value) => OrderRef::parse(value)?,
            None => (self.next_ref)()?,
        };
        let mut draft = self.prepare_draft(order_ref, request, channel).await?;

        let (mut served, mut creation) = self.admit(&draft).await?;
        if generated && (served != Served::Executed || creation.existing) {
            // a server-drawn reference must never resolve to someone else's booking
            tracing::warn!("Generated order reference {} is taken, drawing another", draft.order_ref);
            draft.order_ref = (self.next_ref)()?;
            (served, creation) = self.admit(&draft).await?;
            if served != Served::Executed || creation.existing {
                return Err(CoreError::Conflict(
                    "could not allocate a free order reference".to_string(),
                ));
            }
        }
        let order_ref = draft.order_ref.clone();

        if !creation.booking.matches_draft(&draft) {
            return Err(CoreError::Conflict(format!(
                "order reference {} is already used by a different booking",
                order_ref
            )));
        }

        let replayed = served != Served::Executed || creation.existing;
        let booking = if replayed {
            tracing::info!("Replaying booking {} ({:?})", order_ref, served);
            // cached copies predate payment progress
            self.bookings
                .find_by_order_ref(&order_ref)
                .await?
                .unwrap_or(creation.booking)
        } else {
            tracing::info!(
                "Created booking {} with {} seats, total {} {}",
                order_ref,
                creation.booking.seat_count(),
                creation.booking.total_cents,
                creation.booking.currency
            );
            self.emit(
                TOPIC_BOOKING_CREATED,
                &order_ref,
                &BookingCreatedEvent {
                    booking_id: creation.booking.id,
                    order_ref: order_ref.to_string(),
                    trip_id: creation.booking.trip_id,
                    return_trip_id: creation.booking.return_trip_id,
                    seat_count: creation.booking.seat_count(),
                    total_cents: creation.booking.total_cents,
                    currency: creation.booking.currency.clone(),
                    agent_id: creation.booking.agent_id.clone(),
                    timestamp: Utc::now().timestamp(),
                },
            )
            .await;
            creation.booking
        };

        self.ensure_checkout(booking, replayed).await
    }

    async fn prepare_draft(
        &self,
        order_ref: OrderRef,
        request: BookingRequest,
        channel: SaleChannel,
    ) -> CoreResult<BookingDraft> {
        let outbound = self.bookable_trip(request.trip_id).await?;
        let mut legs = vec![FareLeg {
            fare_cents: outbound.fare_cents,
            seats: request.seats.len(),
        }];

        if let Some(return_trip_id) = request.return_trip_id {
            let inbound = self.bookable_trip(return_trip_id).await?;
            ensure_return_after(outbound.departure_at, inbound.departure_at)?;
            if inbound.currency != outbound.currency {
                return Err(CoreError::ValidationError(
                    "outbound and return trips are priced in different currencies".to_string(),
                ));
            }
            legs.push(FareLeg {
                fare_cents: inbound.fare_cents,
                seats: request.return_seats.len(),
            });
        }

        let agent_id = match channel {
            SaleChannel::Direct => None,
            SaleChannel::Agent { agent_id } => Some(agent_id),
        };
        let quote = self
            .pricing
            .quote(&legs, agent_id.is_some())
            .map_err(|e| CoreError::ValidationError(e.to_string()))?;

        let departure_seats: Vec<String> = request.seats.iter().map(|s| normalize_seat(s)).collect();
        let return_seats: Vec<String> = request.return_seats.iter().map(|s| normalize_seat(s)).collect();
        let passengers = resolve_passengers(&request, &departure_seats, &return_seats);

        Ok(BookingDraft {
            order_ref,
            trip_id: outbound.id,
            return_trip_id: request.return_trip_id,
            contact: request.contact,
            departure_seats,
            return_seats,
            passengers,
            total_cents: quote.net_cents,
            currency: outbound.currency,
            agent_id,
            commission_cents: quote.commission_cents,
        })
    }

    async fn admit(&self, draft: &BookingDraft) -> CoreResult<(Served, BookingCreation)> {
        let (served, result) = self
            .gate
            .run(draft.order_ref.clone(), || self.persist(draft))
            .await;
        Ok((served, result?))
    }

    async fn bookable_trip(&self, trip_id: Uuid) -> CoreResult<Trip> {
        let trip = self
            .trips
            .get_trip(trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", trip_id)))?;
        if trip.departure_at <= Utc::now() {
            return Err(CoreError::ValidationError(format!("trip {} has already departed", trip_id)));
        }
        Ok(trip)
    }

    /// The creation transaction with bounded retry. A duplicate key means
    /// another instance committed first; its row becomes our result.
    async fn persist(&self, draft: &BookingDraft) -> CoreResult<BookingCreation> {
        let outcome = self
            .config
            .retry
            .run("booking creation", |attempt| async move {
                tracing::debug!("Booking {} creation attempt {}", draft.order_ref, attempt);
                self.bookings.create_booking(draft).await
            })
            .await;

        match outcome {
            Err(CoreError::DuplicateOrderRef(_)) => {
                tracing::warn!("Order reference {} was committed concurrently", draft.order_ref);
                match self.bookings.find_by_order_ref(&draft.order_ref).await? {
                    Some(booking) => Ok(BookingCreation {
                        booking,
                        existing: true,
                    }),
                    None => Err(CoreError::Transient(format!(
                        "order reference {} reported as duplicate but not readable yet",
                        draft.order_ref
                    ))),
                }
            }
            other => other,
        }
    }

    async fn ensure_checkout(&self, booking: Booking, replayed: bool) -> CoreResult<Checkout> {
        if booking.booking_status == BookingStatus::Cancelled {
            return Err(CoreError::Conflict(format!("booking {} is cancelled", booking.order_ref)));
        }
        match booking.payment_status {
            PaymentStatus::Paid => Ok(Checkout {
                booking,
                redirect_url: None,
                replayed,
            }),
            PaymentStatus::Failed => Err(CoreError::Conflict(format!(
                "payment for {} failed; submit a new booking",
                booking.order_ref
            ))),
            PaymentStatus::Pending | PaymentStatus::Initiated => {
                let session = match self.payments.open_checkout(&booking).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(
                            "Checkout for {} not opened, booking stays {}: {}",
                            booking.order_ref,
                            booking.payment_status.as_str(),
                            e
                        );
                        return Err(e);
                    }
                };

                let booking = if booking.payment_session_id.as_deref() == Some(session.id.as_str()) {
                    booking
                } else {
                    self.bookings
                        .record_payment_session(&booking.order_ref, &session.id)
                        .await?
                };
                Ok(Checkout {
                    booking,
                    redirect_url: Some(session.url),
                    replayed,
                })
            }
        }
    }

    pub async fn get_booking(&self, order_ref: &OrderRef) -> CoreResult<Booking> {
        self.bookings
            .find_by_order_ref(order_ref)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", order_ref)))
    }

    /// Applies a terminal payment outcome. Safe to call any number of times
    /// and in any order; events fire only when the status actually changes.
    pub async fn reconcile(
        &self,
        order_ref: &OrderRef,
        outcome: PaymentStatus,
    ) -> CoreResult<(Booking, PaymentTransition)> {
        let topic = match outcome {
            PaymentStatus::Paid => TOPIC_BOOKING_PAID,
            PaymentStatus::Failed => TOPIC_BOOKING_PAYMENT_FAILED,
            other => {
                return Err(CoreError::ValidationError(format!(
                    "{} is not a payment outcome",
                    other.as_str()
                )))
            }
        };

        let (booking, transition) = self.bookings.apply_payment_outcome(order_ref, outcome).await?;
        match transition {
            PaymentTransition::Applied => {
                tracing::info!("Booking {} payment {}", order_ref, outcome.as_str());
                if outcome == PaymentStatus::Paid && booking.booking_status == BookingStatus::Cancelled {
                    tracing::warn!("Booking {} was paid after cancellation and needs a refund", order_ref);
                }
                self.emit(
                    topic,
                    order_ref,
                    &PaymentSettledEvent {
                        booking_id: booking.id,
                        order_ref: order_ref.to_string(),
                        outcome: outcome.as_str().to_string(),
                        total_cents: booking.total_cents,
                        currency: booking.currency.clone(),
                        timestamp: Utc::now().timestamp(),
                    },
                )
                .await;
            }
            PaymentTransition::AlreadyApplied => {
                tracing::debug!("Booking {} already {}", order_ref, outcome.as_str());
            }
            PaymentTransition::Ignored => {
                tracing::warn!(
                    "Ignoring {} for booking {} in state {}",
                    outcome.as_str(),
                    order_ref,
                    booking.payment_status.as_str()
                );
            }
        }
        Ok((booking, transition))
    }

    /// Asks the provider for the checkout state and applies it.
    pub async fn verify_payment(&self, order_ref: &OrderRef) -> CoreResult<Booking> {
        let booking = self.get_booking(order_ref).await?;
        let Some(session_id) = booking.payment_session_id.clone() else {
            return Ok(booking);
        };

        match self.payments.session_state(&session_id).await? {
            ProviderPaymentState::Open => Ok(booking),
            ProviderPaymentState::Paid => Ok(self.reconcile(order_ref, PaymentStatus::Paid).await?.0),
            ProviderPaymentState::Failed => Ok(self.reconcile(order_ref, PaymentStatus::Failed).await?.0),
        }
    }

    pub async fn reschedule(
        &self,
        order_ref: &OrderRef,
        request: RescheduleRequest,
    ) -> CoreResult<Rescheduled> {
        let now = Utc::now();
        let new_departure = ChangeHandler::new_departure(&request, now)?;
        let policy = ChangePolicy::new(now, self.config.change_window_hours);

        let rescheduled = self.bookings.reschedule(order_ref, new_departure, policy).await?;
        tracing::info!(
            "Booking {} moved trip {} from {} to {}",
            order_ref,
            rescheduled.trip.id,
            rescheduled.previous_departure,
            rescheduled.trip.departure_at
        );
        self.emit(
            TOPIC_BOOKING_RESCHEDULED,
            order_ref,
            &BookingRescheduledEvent {
                booking_id: rescheduled.booking.id,
                order_ref: order_ref.to_string(),
                trip_id: rescheduled.trip.id,
                previous_departure: rescheduled.previous_departure.timestamp(),
                new_departure: rescheduled.trip.departure_at.timestamp(),
                timestamp: now.timestamp(),
            },
        )
        .await;
        Ok(rescheduled)
    }

    pub async fn add_add_ons(&self, order_ref: &OrderRef, request: AddOnsRequest) -> CoreResult<Booking> {
        ChangeHandler::validate_add_ons(&request.add_ons)?;
        let extra_cents = ChangeHandler::add_ons_total(&request.add_ons)?;
        let add_ons: Vec<AddOn> = request
            .add_ons
            .into_iter()
            .map(|a| AddOn {
                code: a.code.trim().to_ascii_uppercase(),
                ..a
            })
            .collect();

        let policy = ChangePolicy::new(Utc::now(), self.config.change_window_hours);
        let booking = self.bookings.add_add_ons(order_ref, &add_ons, policy).await?;
        tracing::info!(
            "Booking {} gained {} add-ons worth {}",
            order_ref,
            add_ons.len(),
            extra_cents
        );
        Ok(booking)
    }

    pub async fn cancel_booking(&self, order_ref: &OrderRef) -> CoreResult<Booking> {
        let (booking, released) = self.bookings.cancel_booking(order_ref).await?;
        if released > 0 {
            tracing::info!("Booking {} cancelled, {} seats released", order_ref, released);
            self.emit(
                TOPIC_BOOKING_CANCELLED,
                order_ref,
                &BookingCancelledEvent {
                    booking_id: booking.id,
                    order_ref: order_ref.to_string(),
                    released_seats: released,
                    timestamp: Utc::now().timestamp(),
                },
            )
            .await;
        }
        Ok(booking)
    }

    /// Verifies bookings stuck in `initiated` and reports what settled.
    pub async fn sweep_stale_payments(&self) -> CoreResult<SweepReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| CoreError::InternalError(e.to_string()))?;
        let stale = self
            .bookings
            .list_stale_initiated(Utc::now() - stale_after, self.config.sweep_batch)
            .await?;

        let mut report = SweepReport::default();
        for booking in stale {
            match self.verify_payment(&booking.order_ref).await {
                Ok(updated) => match updated.payment_status {
                    PaymentStatus::Paid => report.paid += 1,
                    PaymentStatus::Failed => report.failed += 1,
                    PaymentStatus::Pending | PaymentStatus::Initiated => {}
                },
                Err(e) => tracing::warn!("Could not verify payment for {}: {}", booking.order_ref, e),
            }
        }
        Ok(report)
    }

    async fn emit<E: Serialize>(&self, topic: &str, key: &OrderRef, event: &E) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize {} event for {}: {}", topic, key, e);
                return;
            }
        };
        if let Err(e) = self.events.publish(topic, key.as_str(), &payload).await {
            tracing::error!("Failed to publish {} for {}: {}", topic, key, e);
        }
    }
}

/// One passenger per selected seat; unnamed seats take the contact's name.
fn resolve_passengers(
    request: &BookingRequest,
    departure_seats: &[String],
    return_seats: &[String],
) -> Vec<PassengerDetail> {
    let named = |leg: Leg, seat: &str| {
        request
            .passengers
            .iter()
            .find(|p| p.leg == leg && normalize_seat(&p.seat_label) == seat)
            .map(|p| p.full_name.trim().to_string())
            .unwrap_or_else(|| request.contact.full_name.trim().to_string())
    };

    let departure = departure_seats.iter().map(|seat| PassengerDetail {
        full_name: named(Leg::Departure, seat),
        seat_label: seat.clone(),
        leg: Leg::Departure,
    });
    let inbound = return_seats.iter().map(|seat| PassengerDetail {
        full_name: named(Leg::Return, seat),
        seat_label: seat.clone(),
        leg: Leg::Return,
    });
    departure.chain(inbound).collect()
}
