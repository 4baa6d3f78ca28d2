//! # Prometheus Metrics
//!
//! Protocol activity for the served device, scraped at `/metrics`.
//!
//! Counters are driven by the device's event stream (see [`spawn_recorder`]).
//! Gauges are refreshed from the device itself at scrape time.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::StreamExt;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use tokio::task::JoinHandle;

use seatpass_protocol::{DeviceEvent, SeatDevice};

/// Metric handles for one device.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Seeker alerts raised (after per-peer throttling).
    pub seekers_seen_total: IntCounter,
    /// Offers we broadcast.
    pub requests_sent_total: IntCounter,
    /// Offers we received.
    pub requests_received_total: IntCounter,
    /// Transfers confirmed by a person.
    pub confirmations_total: IntCounter,
    /// Transfers confirmed by the timeout.
    pub auto_confirmations_total: IntCounter,
    pub rejections_total: IntCounter,
    /// Our offers given up without an answer.
    pub expirations_total: IntCounter,
    pub completions_total: IntCounter,
    pub points_awarded_total: IntCounter,
    pub points_spent_total: IntCounter,
    /// Current balance.
    pub points_balance: IntGauge,
    /// Records in the active set, terminal ones included.
    pub active_transfers: IntGauge,
    /// Undecodable broadcast records dropped by discovery.
    pub malformed_payloads: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl NodeMetrics {
    /// Creates and registers every metric under the `seatpass` prefix.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("seatpass".into()), None)?;

        Ok(Self {
            seekers_seen_total: counter(
                &registry,
                "seekers_seen_total",
                "Nearby seeker alerts raised",
            )?,
            requests_sent_total: counter(
                &registry,
                "transfer_requests_sent_total",
                "Seat offers broadcast by this device",
            )?,
            requests_received_total: counter(
                &registry,
                "transfer_requests_received_total",
                "Seat offers received by this device",
            )?,
            confirmations_total: counter(
                &registry,
                "transfer_confirmations_total",
                "Transfers confirmed explicitly",
            )?,
            auto_confirmations_total: counter(
                &registry,
                "transfer_auto_confirmations_total",
                "Transfers confirmed by the confirmation timeout",
            )?,
            rejections_total: counter(
                &registry,
                "transfer_rejections_total",
                "Transfers declined",
            )?,
            expirations_total: counter(
                &registry,
                "transfer_expirations_total",
                "Seat offers that expired unanswered",
            )?,
            completions_total: counter(
                &registry,
                "transfer_completions_total",
                "Transfers settled and paid out",
            )?,
            points_awarded_total: counter(
                &registry,
                "points_awarded_total",
                "Points credited by completed transfers",
            )?,
            points_spent_total: counter(
                &registry,
                "points_spent_total",
                "Points spent or redeemed",
            )?,
            points_balance: gauge(&registry, "points_balance", "Current points balance")?,
            active_transfers: gauge(
                &registry,
                "active_transfers",
                "Transfer records currently held",
            )?,
            malformed_payloads: gauge(
                &registry,
                "malformed_payloads_dropped",
                "Undecodable broadcast records dropped by discovery",
            )?,
            registry,
        })
    }

    /// Counts one device event.
    pub fn record(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::SeekerNearby { .. } => self.seekers_seen_total.inc(),
            DeviceEvent::TransferInitiated { .. } => self.requests_sent_total.inc(),
            DeviceEvent::TransferRequested { .. } => self.requests_received_total.inc(),
            DeviceEvent::TransferConfirmed { auto: true, .. } => {
                self.auto_confirmations_total.inc()
            }
            DeviceEvent::TransferConfirmed { auto: false, .. } => self.confirmations_total.inc(),
            DeviceEvent::TransferRejected { .. } => self.rejections_total.inc(),
            DeviceEvent::TransferExpired { .. } => self.expirations_total.inc(),
            DeviceEvent::TransferCompleted { awarded, .. } => {
                self.completions_total.inc();
                self.points_awarded_total.inc_by(*awarded);
            }
            DeviceEvent::PointsSpent { amount, .. } => self.points_spent_total.inc_by(*amount),
            DeviceEvent::ThankYou { .. } | DeviceEvent::ModeChanged { .. } => {}
        }
    }

    /// Refreshes the gauges from `device`.
    pub fn sync(&self, device: &SeatDevice) {
        let status = device.status();
        self.points_balance
            .set(i64::try_from(status.points.total_points).unwrap_or(i64::MAX));
        self.active_transfers
            .set(i64::try_from(status.active_transfers).unwrap_or(i64::MAX));
        self.malformed_payloads
            .set(i64::try_from(device.dropped_payloads()).unwrap_or(i64::MAX));
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Feeds `device`'s events into `metrics` until the device goes away.
pub fn spawn_recorder(device: &SeatDevice, metrics: SharedMetrics) -> JoinHandle<()> {
    let events = device.event_stream();
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            metrics.record(&event);
        }
    })
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<crate::api::AppState>) -> impl IntoResponse {
    state.metrics.sync(&state.device);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatpass_protocol::transfer::{Direction, TransferRequest};

    #[test]
    fn events_drive_counters() {
        let m = NodeMetrics::new().unwrap();
        let transfer = TransferRequest::new("t1", "A", "B", "pregnant", Direction::Incoming, 0);
        m.record(&DeviceEvent::TransferRequested { transfer });
        m.record(&DeviceEvent::TransferConfirmed {
            transfer_id: "t1".into(),
            auto: true,
        });
        m.record(&DeviceEvent::TransferCompleted {
            transfer_id: "t1".into(),
            awarded: 50,
            total_points: 50,
        });
        m.record(&DeviceEvent::PointsSpent {
            amount: 30,
            balance: 20,
        });
        m.record(&DeviceEvent::TransferExpired {
            transfer_id: "t2".into(),
        });

        assert_eq!(m.requests_received_total.get(), 1);
        assert_eq!(m.auto_confirmations_total.get(), 1);
        assert_eq!(m.confirmations_total.get(), 0);
        assert_eq!(m.completions_total.get(), 1);
        assert_eq!(m.points_awarded_total.get(), 50);
        assert_eq!(m.points_spent_total.get(), 30);
        assert_eq!(m.expirations_total.get(), 1);
        assert_eq!(m.rejections_total.get(), 0);
    }

    #[test]
    fn encoded_output_is_prefixed() {
        let m = NodeMetrics::new().unwrap();
        m.completions_total.inc();
        let text = m.encode().unwrap();
        assert!(text.contains("seatpass_transfer_completions_total 1"));
        assert!(text.contains("seatpass_points_balance 0"));
    }
}
