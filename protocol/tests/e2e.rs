//! End-to-end tests: whole devices talking over the simulated transport.
//!
//! Every test runs real background tasks against the wall clock with
//! shortened intervals, so the waits below are generous upper bounds, not
//! expected durations.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use seatpass_protocol::config::ProtocolConfig;
use seatpass_protocol::device::{DeviceEvent, SeatDevice, UserMode};
use seatpass_protocol::storage::{MemoryStore, SeatDb};
use seatpass_protocol::transfer::TransferStatus;
use seatpass_protocol::transport::{SharedTransport, SimulatedRegistry, SimulatedTransport};
use seatpass_protocol::{system_clock, SharedClock};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> ProtocolConfig {
    ProtocolConfig {
        scan_poll_interval_ms: 20,
        timeout_check_interval_ms: 20,
        completion_delay_ms: 100,
        ..ProtocolConfig::default()
    }
}

fn device(
    registry: &Arc<SimulatedRegistry>,
    clock: &SharedClock,
    config: ProtocolConfig,
) -> SeatDevice {
    let transport: SharedTransport = Arc::new(SimulatedTransport::new(registry.clone()));
    SeatDevice::new(
        transport,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        clock.clone(),
        config,
    )
    .expect("device")
}

/// Polls `cond` until it holds or `limit` passes.
async fn eventually(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Waits for the first event matching `pred`.
async fn next_matching(
    device: &SeatDevice,
    limit: Duration,
    pred: impl Fn(&DeviceEvent) -> bool,
) -> Option<DeviceEvent> {
    let stream = device.event_stream();
    tokio::pin!(stream);
    tokio::time::timeout(limit, async {
        while let Some(event) = stream.next().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

struct Pair {
    registry: Arc<SimulatedRegistry>,
    giver: SeatDevice,
    seeker: SeatDevice,
}

fn pair(config: ProtocolConfig) -> Pair {
    let clock = system_clock();
    let registry = Arc::new(SimulatedRegistry::new(clock.clone()));
    let giver = device(&registry, &clock, config.clone());
    let seeker = device(&registry, &clock, config);
    seeker.set_mode(UserMode::NeedSeat);
    Pair {
        registry,
        giver,
        seeker,
    }
}

// ---------------------------------------------------------------------------
// 1. Full handshake, explicit confirmation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn giver_and_seeker_complete_a_transfer() {
    let p = pair(fast_config());
    p.giver.start();
    p.seeker.start();

    // The giver notices the seeker.
    let seeker_id = p.seeker.device_id().to_string();
    let alert = next_matching(&p.giver, Duration::from_secs(3), |e| {
        matches!(e, DeviceEvent::SeekerNearby { .. })
    })
    .await
    .expect("seeker alert");
    assert_eq!(
        alert,
        DeviceEvent::SeekerNearby {
            peer_id: seeker_id.clone()
        }
    );

    // Offer the seat.
    let id = p.giver.initiate_transfer(&seeker_id, "pregnant");
    assert!(
        eventually(Duration::from_secs(3), || p.seeker.transfers().get(&id).is_some()).await,
        "seeker never heard the request"
    );
    let incoming = p.seeker.transfers().get(&id).unwrap();
    assert_eq!(incoming.status, TransferStatus::Pending);
    assert_eq!(incoming.receiver_type, "pregnant");
    assert_eq!(incoming.sender_device_id, p.giver.device_id());

    // Accept it.
    assert!(p.seeker.confirm(&id, true));

    assert!(
        eventually(Duration::from_secs(3), || p.giver.points().total_points == 50).await,
        "giver was never paid"
    );
    assert_eq!(p.giver.points().total_transfers, 1);
    assert_eq!(p.giver.thank_you_messages().len(), 1);
    assert_eq!(p.giver.thank_you_messages()[0].transfer_id, id);
    assert!(p.giver.active_transfers().is_empty());

    assert!(
        eventually(Duration::from_secs(3), || p.seeker.active_transfers().is_empty()).await,
        "record never left the seeker's active set"
    );
    assert_eq!(p.seeker.points().total_points, 50);

    p.giver.shutdown().await;
    p.seeker.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Unanswered request settles through the timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unanswered_request_is_auto_confirmed() {
    let p = pair(ProtocolConfig {
        confirmation_timeout_ms: 300,
        ..fast_config()
    });
    p.giver.start();
    p.seeker.start();

    let seeker_id = p.seeker.device_id().to_string();
    let auto = {
        let id = p.giver.initiate_transfer(&seeker_id, "elderly");
        let event = next_matching(&p.seeker, Duration::from_secs(3), |e| {
            matches!(e, DeviceEvent::TransferConfirmed { transfer_id, .. } if *transfer_id == id)
        })
        .await
        .expect("seeker auto-confirmed");
        matches!(event, DeviceEvent::TransferConfirmed { auto: true, .. })
    };
    assert!(auto);

    assert!(
        eventually(Duration::from_secs(3), || {
            p.giver.points().total_points == 50 && p.seeker.points().total_points == 50
        })
        .await
    );
    // The giver's copy was settled by the seeker's broadcast, not its own timer.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(p.giver.points().total_transfers, 1);
    assert_eq!(p.seeker.points().total_transfers, 1);
    assert_eq!(p.giver.thank_you_messages().len(), 1);

    p.giver.shutdown().await;
    p.seeker.shutdown().await;
}

#[tokio::test]
async fn silent_seeker_without_auto_confirm_pays_nobody() {
    let config = ProtocolConfig {
        confirmation_timeout_ms: 300,
        ..fast_config()
    };
    let p = pair(config);
    let mut settings = p.seeker.settings();
    settings.auto_confirm = false;
    p.seeker.update_settings(settings);
    p.giver.start();
    p.seeker.start();

    let id = p.giver.initiate_transfer(p.seeker.device_id(), "elderly");
    assert!(eventually(Duration::from_secs(3), || p.seeker.transfers().get(&id).is_some()).await);

    // Several of the giver's timeout periods go by without an answer.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(p.giver.transfers().get(&id).unwrap().is_pending());
    assert!(p.seeker.transfers().get(&id).unwrap().is_pending());
    assert_eq!(p.giver.points().total_points, 0);
    assert_eq!(p.seeker.points().total_points, 0);

    p.giver.shutdown().await;
    p.seeker.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_transfer_pays_nobody() {
    let p = pair(fast_config());
    p.giver.start();
    p.seeker.start();

    let id = p.giver.initiate_transfer(p.seeker.device_id(), "injured");
    assert!(eventually(Duration::from_secs(3), || p.seeker.transfers().get(&id).is_some()).await);
    assert!(p.seeker.confirm(&id, false));

    assert!(
        eventually(Duration::from_secs(3), || {
            p.giver
                .transfers()
                .get(&id)
                .map(|r| r.status == TransferStatus::Rejected)
                .unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(p.giver.points().total_points, 0);
    assert_eq!(p.seeker.points().total_points, 0);
    assert!(p.giver.thank_you_messages().is_empty());

    assert_eq!(p.giver.clear_finished(), 1);
    assert!(p.giver.active_transfers().is_empty());

    p.giver.shutdown().await;
    p.seeker.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Discovery never re-dispatches a message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn injected_request_is_delivered_once() {
    let clock = system_clock();
    let registry = Arc::new(SimulatedRegistry::new(clock.clone()));
    let solo = device(&registry, &clock, fast_config());
    let mut events = solo.subscribe_events();
    solo.start();

    registry.inject_test_request("test-0001", "pregnant");

    // Many poll intervals pass while the message is still within the horizon.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut requested = 0;
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::TransferRequested { transfer } = event {
            assert_eq!(transfer.sender_device_id, "TEST_DEVICE_OTHER");
            requested += 1;
        }
    }
    assert_eq!(requested, 1);
    assert_eq!(solo.active_transfers().len(), 1);

    solo.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Stopped devices leave the registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_unregisters_presence() {
    let p = pair(fast_config());
    p.seeker.start();
    assert_eq!(p.registry.advertising_peers().len(), 1);
    p.seeker.shutdown().await;
    assert!(p.registry.advertising_peers().is_empty());
}

// ---------------------------------------------------------------------------
// 6. Ledger survives a restart
// ---------------------------------------------------------------------------

#[test]
fn ledger_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = system_clock();
    let registry = Arc::new(SimulatedRegistry::new(clock.clone()));

    {
        let db = SeatDb::open(dir.path()).expect("open");
        let device = SeatDevice::with_db(
            Arc::new(SimulatedTransport::new(registry.clone())),
            &db,
            clock.clone(),
            ProtocolConfig::default(),
        )
        .expect("device");
        device.ledger().add_points(50);
        device.ledger().add_points(50);
        assert!(device.spend(30));
        device.set_mode(UserMode::NeedSeat);
        db.flush().expect("flush");
    }

    let db = SeatDb::open(dir.path()).expect("reopen");
    let device = SeatDevice::with_db(
        Arc::new(SimulatedTransport::new(registry)),
        &db,
        clock,
        ProtocolConfig::default(),
    )
    .expect("device");
    assert_eq!(device.points().total_points, 70);
    assert_eq!(device.points().total_transfers, 2);
    assert_eq!(device.mode(), UserMode::NeedSeat);
}
