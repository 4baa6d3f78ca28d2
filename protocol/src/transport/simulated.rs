//! In-process transport backend.
//!
//! Every simulated device shares one [`SimulatedRegistry`]: the set of ids
//! currently advertising presence and a timestamp-ordered list of transfer
//! messages. The registry is an explicit object handed to each transport,
//! never a global. All reads and writes go through a single mutex, so no
//! caller ever sees half of another caller's update.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{BroadcastRecord, ObservationSource, ServiceTag, Transport, TransportKind};
use crate::clock::{Clock, SharedClock};
use crate::codec;
use crate::config::{SIMULATED_DEVICE_PREFIX, TEST_PEER_ID};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryState {
    advertising: BTreeSet<String>,
    /// Kept sorted by `timestamp_ms`.
    messages: Vec<BroadcastRecord>,
}

/// Shared medium for simulated transports.
#[derive(Debug)]
pub struct SimulatedRegistry {
    state: Mutex<RegistryState>,
    next_device: AtomicU64,
    clock: SharedClock,
}

impl SimulatedRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_device: AtomicU64::new(1),
            clock,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Hands out the next `MOCK_DEVICE_n` identifier.
    pub fn allocate_device_id(&self) -> String {
        let n = self.next_device.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", SIMULATED_DEVICE_PREFIX, n)
    }

    /// Adds `id` to the advertising set. Returns false if already present.
    pub fn register_presence(&self, id: &str) -> bool {
        self.state.lock().advertising.insert(id.to_string())
    }

    /// Removes `id` from the advertising set. Returns false if absent.
    pub fn unregister_presence(&self, id: &str) -> bool {
        self.state.lock().advertising.remove(id)
    }

    /// Appends a message stamped with the registry clock.
    pub fn publish(&self, origin: &str, tag: ServiceTag, payload: Bytes) {
        let mut state = self.state.lock();
        let timestamp_ms = self.clock.now_ms();
        let record = BroadcastRecord {
            origin: origin.to_string(),
            tag,
            payload,
            timestamp_ms,
        };
        // A clock that stepped backwards must not break the ordering.
        let at = state
            .messages
            .partition_point(|m| m.timestamp_ms <= timestamp_ms);
        state.messages.insert(at, record);
    }

    /// Puts a transfer request from [`TEST_PEER_ID`] on the medium, as if a
    /// nearby device had just asked this one for its seat.
    pub fn inject_test_request(&self, transfer_id: &str, receiver_type: &str) {
        info!(transfer_id, receiver_type, "injecting test transfer request");
        self.publish(
            TEST_PEER_ID,
            ServiceTag::TransferRequest,
            codec::encode(transfer_id, receiver_type),
        );
    }

    pub fn advertising_peers(&self) -> Vec<String> {
        self.state.lock().advertising.iter().cloned().collect()
    }

    pub fn messages_since(&self, since_ms: u64) -> Vec<BroadcastRecord> {
        let state = self.state.lock();
        let start = state
            .messages
            .partition_point(|m| m.timestamp_ms < since_ms);
        state.messages[start..].to_vec()
    }

    pub fn prune(&self, older_than_ms: u64) {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.timestamp_ms >= older_than_ms);
        let dropped = before - state.messages.len();
        if dropped > 0 {
            debug!(dropped, "pruned simulated messages");
        }
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One simulated device on a [`SimulatedRegistry`].
#[derive(Debug)]
pub struct SimulatedTransport {
    id: String,
    registry: Arc<SimulatedRegistry>,
    advertising: AtomicBool,
    scanning: AtomicBool,
}

impl SimulatedTransport {
    /// Joins `registry` under a freshly allocated `MOCK_DEVICE_n` id.
    pub fn new(registry: Arc<SimulatedRegistry>) -> Self {
        let id = registry.allocate_device_id();
        Self::with_id(registry, id)
    }

    /// Joins `registry` under a caller-chosen id.
    pub fn with_id(registry: Arc<SimulatedRegistry>, id: impl Into<String>) -> Self {
        let id = id.into();
        debug!(%id, "simulated transport created");
        Self {
            id,
            registry,
            advertising: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<SimulatedRegistry> {
        &self.registry
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }
}

impl ObservationSource for SimulatedTransport {
    fn advertising_peers(&self) -> Vec<String> {
        if !self.is_scanning() {
            return Vec::new();
        }
        self.registry.advertising_peers()
    }

    fn messages_since(&self, since_ms: u64) -> Vec<BroadcastRecord> {
        if !self.is_scanning() {
            return Vec::new();
        }
        self.registry.messages_since(since_ms)
    }

    fn prune(&self, older_than_ms: u64) {
        self.registry.prune(older_than_ms);
    }
}

impl Transport for SimulatedTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn start_advertising(&self) {
        if !self.advertising.swap(true, Ordering::SeqCst) {
            self.registry.register_presence(&self.id);
            debug!(id = %self.id, "simulated presence on");
        }
    }

    fn stop_advertising(&self) {
        if self.advertising.swap(false, Ordering::SeqCst) {
            self.registry.unregister_presence(&self.id);
            debug!(id = %self.id, "simulated presence off");
        }
    }

    fn advertise(&self, tag: ServiceTag, payload: Bytes, _duration: Duration) {
        // The registry horizon stands in for the on-air duration.
        if tag == ServiceTag::Presence {
            self.start_advertising();
            return;
        }
        self.registry.publish(&self.id, tag, payload);
    }

    fn start_scanning(&self) {
        self.scanning.store(true, Ordering::SeqCst);
    }

    fn stop_scanning(&self) {
        self.scanning.store(false, Ordering::SeqCst);
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.registry.unregister_presence(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn setup() -> (Arc<ManualClock>, Arc<SimulatedRegistry>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(SimulatedRegistry::new(clock.clone()));
        (clock, registry)
    }

    #[test]
    fn ids_are_sequential_mock_ids() {
        let (_, registry) = setup();
        let a = SimulatedTransport::new(registry.clone());
        let b = SimulatedTransport::new(registry);
        assert_eq!(a.local_id(), "MOCK_DEVICE_1");
        assert_eq!(b.local_id(), "MOCK_DEVICE_2");
    }

    #[test]
    fn presence_is_visible_and_released() {
        let (_, registry) = setup();
        let a = SimulatedTransport::new(registry.clone());
        let b = SimulatedTransport::new(registry.clone());
        b.start_scanning();

        a.start_advertising();
        a.start_advertising();
        assert_eq!(b.advertising_peers(), vec!["MOCK_DEVICE_1".to_string()]);

        a.stop_advertising();
        assert!(b.advertising_peers().is_empty());
    }

    #[test]
    fn dropped_transport_leaves_registry() {
        let (_, registry) = setup();
        {
            let a = SimulatedTransport::new(registry.clone());
            a.start_advertising();
            assert_eq!(registry.advertising_peers().len(), 1);
        }
        assert!(registry.advertising_peers().is_empty());
    }

    #[test]
    fn idle_scanner_sees_nothing() {
        let (_, registry) = setup();
        let a = SimulatedTransport::new(registry.clone());
        let b = SimulatedTransport::new(registry);
        a.start_advertising();
        a.advertise(
            ServiceTag::TransferRequest,
            codec::encode("t1", "x"),
            Duration::from_secs(3),
        );
        assert!(b.advertising_peers().is_empty());
        assert!(b.messages_since(0).is_empty());
    }

    #[test]
    fn messages_since_is_inclusive() {
        let (clock, registry) = setup();
        registry.publish("A", ServiceTag::TransferRequest, Bytes::from_static(b"1"));
        clock.advance(100);
        registry.publish("A", ServiceTag::TransferConfirm, Bytes::from_static(b"2"));

        assert_eq!(registry.messages_since(1_000).len(), 2);
        let later = registry.messages_since(1_100);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].tag, ServiceTag::TransferConfirm);
        assert!(registry.messages_since(1_101).is_empty());
    }

    #[test]
    fn messages_stay_ordered_when_clock_steps_back() {
        let (clock, registry) = setup();
        registry.publish("A", ServiceTag::TransferRequest, Bytes::new());
        clock.set(500);
        registry.publish("B", ServiceTag::TransferRequest, Bytes::new());
        let all = registry.messages_since(0);
        assert_eq!(all[0].origin, "B");
        assert_eq!(all[1].origin, "A");
    }

    #[test]
    fn prune_drops_old_messages() {
        let (clock, registry) = setup();
        registry.publish("A", ServiceTag::TransferRequest, Bytes::new());
        clock.advance(11_000);
        registry.publish("A", ServiceTag::TransferRequest, Bytes::new());
        registry.prune(clock.now_ms() - 10_000);
        assert_eq!(registry.message_count(), 1);
    }

    #[test]
    fn injected_request_decodes() {
        let (_, registry) = setup();
        registry.inject_test_request("test-1", "elderly");
        let msgs = registry.messages_since(0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].origin, TEST_PEER_ID);
        let payload = codec::decode(&msgs[0].payload).unwrap();
        assert_eq!(payload.transfer_id, "test-1");
        assert_eq!(payload.data, "elderly");
    }

    #[test]
    fn concurrent_publishers_lose_nothing() {
        let (_, registry) = setup();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.publish(
                            &format!("P{}", i),
                            ServiceTag::TransferRequest,
                            Bytes::new(),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.message_count(), 800);
    }
}
