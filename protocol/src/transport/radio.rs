//! Real-radio transport backend.
//!
//! The platform side (a BLE stack, in practice) is reached through the
//! [`RadioAdapter`] trait. Scan callbacks are pushed into
//! [`RadioTransport::handle_scan_result`] and buffered until the discovery
//! loop polls, so both backends look the same from above.
//!
//! Adapter errors stop here. Each one is logged at `warn` and the
//! operation that hit it does nothing.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    BroadcastRecord, ObservationSource, ServiceTag, Transport, TransportError, TransportKind,
};
use crate::clock::{Clock, SharedClock};
use crate::config::{
    MANUFACTURER_ID, PRESENCE_SERVICE_UUID, TRANSFER_CONFIRM_SERVICE_UUID,
    TRANSFER_REQUEST_SERVICE_UUID,
};

// ---------------------------------------------------------------------------
// Platform Types
// ---------------------------------------------------------------------------

/// Opaque token for a running advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertiseHandle(pub u64);

/// What goes on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub service_uuid: &'static str,
    /// Manufacturer-specific data, keyed by [`MANUFACTURER_ID`].
    pub manufacturer_data: Option<(u16, Bytes)>,
    pub include_device_name: bool,
}

/// How it goes on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub low_latency: bool,
    pub high_tx_power: bool,
    pub connectable: bool,
    /// `None` advertises until stopped.
    pub timeout: Option<Duration>,
}

impl AdvertiseSettings {
    /// Long-running presence beacon.
    pub fn presence() -> Self {
        Self {
            low_latency: true,
            high_tx_power: true,
            connectable: false,
            timeout: None,
        }
    }

    /// A transfer message that the radio drops by itself after `duration`.
    pub fn transient(duration: Duration) -> Self {
        Self {
            timeout: Some(duration),
            ..Self::presence()
        }
    }
}

/// One advertisement heard by the scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    pub device_address: String,
    pub service_uuids: Vec<String>,
    pub manufacturer_data: HashMap<u16, Bytes>,
}

/// Platform radio primitives.
pub trait RadioAdapter: Send + Sync {
    /// Hardware address used as this device's id.
    fn device_address(&self) -> String;

    /// Whether the radio exists, is on, and may be used.
    fn check_available(&self) -> Result<(), TransportError>;

    /// Starts a scan filtered to `service_uuids`. Results are delivered to
    /// [`RadioTransport::handle_scan_result`] by the platform glue.
    fn start_scan(&self, service_uuids: &[&'static str]) -> Result<(), TransportError>;

    fn stop_scan(&self) -> Result<(), TransportError>;

    fn start_advertising(
        &self,
        data: AdvertisementData,
        settings: AdvertiseSettings,
    ) -> Result<AdvertiseHandle, TransportError>;

    fn stop_advertising(&self, handle: AdvertiseHandle) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// RadioTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RadioState {
    scanning: bool,
    presence: Option<AdvertiseHandle>,
    /// Peer address → last time its presence beacon was heard.
    peers: HashMap<String, u64>,
    /// Transfer records heard since the last prune, oldest first.
    inbox: Vec<BroadcastRecord>,
}

/// [`Transport`] over a [`RadioAdapter`].
pub struct RadioTransport<A> {
    adapter: A,
    local_id: String,
    clock: SharedClock,
    state: Mutex<RadioState>,
}

impl<A: RadioAdapter> RadioTransport<A> {
    pub fn new(adapter: A, clock: SharedClock) -> Self {
        let local_id = adapter.device_address();
        Self {
            adapter,
            local_id,
            clock,
            state: Mutex::new(RadioState::default()),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Feeds one scan callback into the transport.
    ///
    /// Presence beacons refresh the peer table. Transfer records need the
    /// manufacturer data under [`MANUFACTURER_ID`]; without it they are
    /// dropped here.
    pub fn handle_scan_result(&self, record: ScanRecord) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if !state.scanning {
            return;
        }

        for uuid in &record.service_uuids {
            let Some(tag) = ServiceTag::from_uuid(uuid) else {
                continue;
            };
            if !tag.carries_payload() {
                state.peers.insert(record.device_address.clone(), now);
                continue;
            }
            match record.manufacturer_data.get(&MANUFACTURER_ID) {
                Some(payload) => {
                    trace!(origin = %record.device_address, ?tag, "transfer record heard");
                    state.inbox.push(BroadcastRecord {
                        origin: record.device_address.clone(),
                        tag,
                        payload: payload.clone(),
                        timestamp_ms: now,
                    });
                }
                None => {
                    debug!(
                        origin = %record.device_address,
                        ?tag,
                        "transfer record without payload dropped"
                    );
                }
            }
        }
    }
}

impl<A: RadioAdapter> ObservationSource for RadioTransport<A> {
    fn advertising_peers(&self) -> Vec<String> {
        self.state.lock().peers.keys().cloned().collect()
    }

    fn messages_since(&self, since_ms: u64) -> Vec<BroadcastRecord> {
        self.state
            .lock()
            .inbox
            .iter()
            .filter(|m| m.timestamp_ms >= since_ms)
            .cloned()
            .collect()
    }

    fn prune(&self, older_than_ms: u64) {
        let mut state = self.state.lock();
        state.inbox.retain(|m| m.timestamp_ms >= older_than_ms);
        state.peers.retain(|_, seen| *seen >= older_than_ms);
    }
}

impl<A: RadioAdapter> Transport for RadioTransport<A> {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Radio
    }

    fn start_advertising(&self) {
        let mut state = self.state.lock();
        if state.presence.is_some() {
            return;
        }
        let data = AdvertisementData {
            service_uuid: PRESENCE_SERVICE_UUID,
            manufacturer_data: None,
            include_device_name: false,
        };
        match self
            .adapter
            .start_advertising(data, AdvertiseSettings::presence())
        {
            Ok(handle) => state.presence = Some(handle),
            Err(e) => warn!(error = %e, "presence advertising failed"),
        }
    }

    fn stop_advertising(&self) {
        let Some(handle) = self.state.lock().presence.take() else {
            return;
        };
        if let Err(e) = self.adapter.stop_advertising(handle) {
            warn!(error = %e, "stopping presence advertising failed");
        }
    }

    fn advertise(&self, tag: ServiceTag, payload: Bytes, duration: Duration) {
        if tag == ServiceTag::Presence {
            self.start_advertising();
            return;
        }
        let data = AdvertisementData {
            service_uuid: tag.uuid(),
            manufacturer_data: Some((MANUFACTURER_ID, payload)),
            include_device_name: false,
        };
        if let Err(e) = self
            .adapter
            .start_advertising(data, AdvertiseSettings::transient(duration))
        {
            warn!(error = %e, ?tag, "transfer advertising failed");
        }
    }

    fn start_scanning(&self) {
        let mut state = self.state.lock();
        if state.scanning {
            return;
        }
        let filter = [
            PRESENCE_SERVICE_UUID,
            TRANSFER_REQUEST_SERVICE_UUID,
            TRANSFER_CONFIRM_SERVICE_UUID,
        ];
        match self.adapter.start_scan(&filter) {
            Ok(()) => state.scanning = true,
            Err(e) => warn!(error = %e, "scan start failed"),
        }
    }

    fn stop_scanning(&self) {
        let mut state = self.state.lock();
        if !state.scanning {
            return;
        }
        state.scanning = false;
        if let Err(e) = self.adapter.stop_scan() {
            warn!(error = %e, "scan stop failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
