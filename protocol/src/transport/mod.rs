//! # Transport Abstraction
//!
//! A transport puts short-lived records on a broadcast channel and reports
//! what it hears. Delivery is at-most-once and lossy; nothing here retries.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs        — ServiceTag, BroadcastRecord, Transport + ObservationSource traits,
//!                 startup backend selection
//! simulated.rs  — in-process backend over a shared SimulatedRegistry
//! radio.rs      — maps the contract onto platform radio primitives (RadioAdapter)
//! ```
//!
//! Both backends are pull-based from the discovery loop's point of view:
//! they expose an [`ObservationSource`] that the loop polls on its own
//! timer. The simulated backend keeps records in its registry; the radio
//! backend buffers scan callbacks until the next poll.
//!
//! Transport calls never fail toward the caller. Platform errors are caught
//! at this boundary, logged, and the operation degrades to a no-op.

pub mod radio;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::{
    PRESENCE_SERVICE_UUID, TRANSFER_CONFIRM_SERVICE_UUID, TRANSFER_REQUEST_SERVICE_UUID,
};

pub use radio::{
    AdvertiseHandle, AdvertiseSettings, AdvertisementData, RadioAdapter, RadioTransport,
    ScanRecord,
};
pub use simulated::{SimulatedRegistry, SimulatedTransport};

// ---------------------------------------------------------------------------
// Service Tags
// ---------------------------------------------------------------------------

/// The advertising channel a record is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceTag {
    /// "Someone here needs a seat." No payload.
    Presence,
    /// A transfer request payload.
    TransferRequest,
    /// A transfer confirmation payload.
    TransferConfirm,
}

impl ServiceTag {
    pub fn uuid(&self) -> &'static str {
        match self {
            Self::Presence => PRESENCE_SERVICE_UUID,
            Self::TransferRequest => TRANSFER_REQUEST_SERVICE_UUID,
            Self::TransferConfirm => TRANSFER_CONFIRM_SERVICE_UUID,
        }
    }

    /// Maps a service UUID back to its tag. Radio stacks are inconsistent
    /// about case, so the comparison ignores it.
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        [Self::Presence, Self::TransferRequest, Self::TransferConfirm]
            .into_iter()
            .find(|tag| tag.uuid().eq_ignore_ascii_case(uuid))
    }

    /// Whether records on this tag carry a transfer payload.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, Self::Presence)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A transfer message as observed on the channel, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    /// Identifier of the advertiser.
    pub origin: String,
    /// Channel the record arrived on.
    pub tag: ServiceTag,
    /// Manufacturer-data payload (see [`crate::codec`]).
    pub payload: Bytes,
    /// When the record was put on air (simulated) or heard (radio).
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by the underlying radio. These never escape the
/// transport: they are logged and the operation becomes a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No radio, or the radio is switched off.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The OS refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The controller reported an error.
    #[error("hardware error: {0}")]
    Hardware(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// What the discovery loop polls.
pub trait ObservationSource: Send + Sync {
    /// Identifiers currently advertising presence. May include the caller.
    fn advertising_peers(&self) -> Vec<String>;

    /// Transfer records with `timestamp_ms >= since_ms`, oldest first.
    fn messages_since(&self, since_ms: u64) -> Vec<BroadcastRecord>;

    /// Drops records older than `older_than_ms`.
    fn prune(&self, older_than_ms: u64);
}

/// Which backend a device ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Radio,
    Simulated,
}

/// The broadcast transport contract.
///
/// All methods return immediately. Results arrive through the
/// [`ObservationSource`] side, never as return values.
pub trait Transport: ObservationSource {
    /// This device's identifier on the channel.
    fn local_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Starts advertising presence until [`stop_advertising`](Self::stop_advertising).
    /// Idempotent.
    fn start_advertising(&self);

    /// Stops presence advertising. Idempotent.
    fn stop_advertising(&self);

    /// Puts a transfer payload on air under `tag` for roughly `duration`.
    fn advertise(&self, tag: ServiceTag, payload: Bytes, duration: Duration);

    /// Starts hearing the channel. Idempotent.
    fn start_scanning(&self);

    /// Stops hearing the channel. Idempotent.
    fn stop_scanning(&self);

    /// Stops everything and unregisters from any shared state.
    fn shutdown(&self) {
        self.stop_scanning();
        self.stop_advertising();
    }
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

// ---------------------------------------------------------------------------
// Backend Selection
// ---------------------------------------------------------------------------

/// Chooses the backend at startup.
///
/// A present, available radio wins. Anything else (no adapter, radio off,
/// no permission) falls back to a simulated transport on `registry`. This is
/// the only place [`TransportError::Unavailable`] matters; after startup the
/// choice is fixed.
pub fn select_transport<A>(
    adapter: Option<A>,
    registry: Arc<SimulatedRegistry>,
    clock: SharedClock,
) -> SharedTransport
where
    A: RadioAdapter + 'static,
{
    match adapter {
        Some(adapter) => match adapter.check_available() {
            Ok(()) => {
                info!("radio available, using radio transport");
                Arc::new(RadioTransport::new(adapter, clock))
            }
            Err(e) => {
                warn!(error = %e, "radio unusable, falling back to simulated transport");
                Arc::new(SimulatedTransport::new(registry))
            }
        },
        None => {
            info!("no radio adapter, using simulated transport");
            Arc::new(SimulatedTransport::new(registry))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
