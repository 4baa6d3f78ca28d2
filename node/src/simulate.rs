//! # In-Process Simulation
//!
//! Several devices on one [`SimulatedRegistry`]: the first needs a seat,
//! the rest offer theirs to any seeker they find. Each device keeps its
//! ledger in memory; the run ends after a fixed wall-clock duration and
//! reports every ledger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;

use seatpass_protocol::storage::MemoryStore;
use seatpass_protocol::{
    system_clock, DeviceEvent, ProtocolConfig, SeatDevice, SharedClock, SimulatedRegistry,
    SimulatedTransport, UserMode,
};

use crate::cli::{AnswerMode, SimulateArgs};

/// What to simulate.
#[derive(Debug, Clone)]
pub struct Plan {
    pub devices: usize,
    pub answer: AnswerMode,
    pub receiver_type: String,
    pub duration: Duration,
}

impl From<&SimulateArgs> for Plan {
    fn from(args: &SimulateArgs) -> Self {
        Self {
            devices: usize::from(args.devices),
            answer: args.answer,
            receiver_type: args.receiver_type.clone(),
            duration: Duration::from_secs(args.duration_secs),
        }
    }
}

/// One line of the final report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub mode: UserMode,
    pub total_points: u64,
    pub total_transfers: u64,
    pub thank_you_messages: usize,
}

/// A device on `registry` with an in-memory ledger.
pub fn memory_device(
    registry: &Arc<SimulatedRegistry>,
    clock: &SharedClock,
    config: &ProtocolConfig,
) -> anyhow::Result<Arc<SeatDevice>> {
    let device = SeatDevice::new(
        Arc::new(SimulatedTransport::new(registry.clone())),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        clock.clone(),
        config.clone(),
    )
    .context("failed to assemble simulated device")?;
    Ok(Arc::new(device))
}

/// Offers `device`'s seat once to every seeker it is alerted about.
pub fn spawn_giver(device: Arc<SeatDevice>, receiver_type: String) -> JoinHandle<()> {
    let events = device.event_stream();
    tokio::spawn(async move {
        tokio::pin!(events);
        let mut offered = HashSet::new();
        while let Some(event) = events.next().await {
            if let DeviceEvent::SeekerNearby { peer_id } = event {
                if offered.insert(peer_id.clone()) {
                    let id = device.initiate_transfer(&peer_id, &receiver_type);
                    tracing::info!(
                        device = %device.device_id(),
                        peer = %peer_id,
                        transfer_id = %id,
                        "offered seat"
                    );
                }
            }
        }
    })
}

/// Accepts every offer `device` receives.
fn spawn_acceptor(device: Arc<SeatDevice>) -> JoinHandle<()> {
    let events = device.event_stream();
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            if let DeviceEvent::TransferRequested { transfer } = event {
                device.confirm(&transfer.id, true);
            }
        }
    })
}

/// Runs `plan` to completion and reports every device, seeker first.
pub async fn run(plan: &Plan, config: &ProtocolConfig) -> anyhow::Result<Vec<DeviceReport>> {
    let clock = system_clock();
    let registry = Arc::new(SimulatedRegistry::new(clock.clone()));

    let mut devices = Vec::with_capacity(plan.devices);
    let mut drivers = Vec::new();
    for i in 0..plan.devices {
        let device = memory_device(&registry, &clock, config)?;
        if i == 0 {
            device.set_mode(UserMode::NeedSeat);
            if plan.answer == AnswerMode::Explicit {
                drivers.push(spawn_acceptor(device.clone()));
            }
        } else {
            drivers.push(spawn_giver(device.clone(), plan.receiver_type.clone()));
        }
        devices.push(device);
    }

    tracing::info!(
        devices = plan.devices,
        answer = ?plan.answer,
        duration_ms = plan.duration.as_millis() as u64,
        "simulation starting"
    );
    for device in &devices {
        device.start();
    }

    tokio::time::sleep(plan.duration).await;

    for device in &devices {
        device.shutdown().await;
    }
    for driver in drivers {
        driver.abort();
    }

    let reports = devices
        .iter()
        .map(|d| {
            let points = d.points();
            DeviceReport {
                device_id: d.device_id().to_string(),
                mode: d.mode(),
                total_points: points.total_points,
                total_transfers: points.total_transfers,
                thank_you_messages: d.thank_you_messages().len(),
            }
        })
        .collect();
    Ok(reports)
}
