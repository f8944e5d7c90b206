use std::sync::Arc;

use busline_booking::{BookingService, SweepReport};
use busline_core::booking::PaymentStatus;
use prometheus::IntCounterVec;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Periodically asks the provider about bookings stuck in `initiated`, for
/// when a webhook never arrives.
pub async fn start_payment_sweeper(service: Arc<BookingService>, every: Duration, reconciled: IntCounterVec) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Payment sweeper started, running every {:?}", every);

    loop {
        ticker.tick().await;
        match service.sweep_stale_payments().await {
            Ok(report) if report.settled() == 0 => {}
            Ok(report) => {
                info!("Sweeper settled {} paid and {} failed payments", report.paid, report.failed);
                record_sweep(&reconciled, report);
            }
            Err(e) => error!("Payment sweep failed: {}", e),
        }
    }
}

fn record_sweep(reconciled: &IntCounterVec, report: SweepReport) {
    for (status, count) in [(PaymentStatus::Paid, report.paid), (PaymentStatus::Failed, report.failed)] {
        if count > 0 {
            reconciled
                .with_label_values(&[status.as_str(), "sweeper"])
                .inc_by(count as u64);
        }
    }
}
