//! # Protocol Configuration & Constants
//!
//! Every magic number in SeatPass lives here. If you're hardcoding an
//! interval or a service identifier somewhere else, move it here.
//!
//! Two devices that disagree on these values will not hear each other, so
//! the wire-level constants (service tags, manufacturer id, payload layout)
//! are effectively frozen once devices ship. The timing constants are the
//! reference policy and can be tuned per deployment through
//! [`ProtocolConfig`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Service Tags
// ---------------------------------------------------------------------------

/// Advertised by a device whose user needs a seat. Scanners that see this
/// tag report the advertiser as a nearby seeker.
pub const PRESENCE_SERVICE_UUID: &str = "0000FFF0-0000-1000-8000-00805F9B34FB";

/// Carries a transfer request payload (giver → seeker).
pub const TRANSFER_REQUEST_SERVICE_UUID: &str = "0000FFF1-0000-1000-8000-00805F9B34FB";

/// Carries a transfer confirmation payload (seeker → giver).
pub const TRANSFER_CONFIRM_SERVICE_UUID: &str = "0000FFF2-0000-1000-8000-00805F9B34FB";

/// Manufacturer id under which transfer payloads are placed in the
/// advertisement's manufacturer-specific data field. 0xFFFF is the value
/// reserved for testing and internal use, which is what we are.
pub const MANUFACTURER_ID: u16 = 0xFFFF;

// ---------------------------------------------------------------------------
// Payload Layout
// ---------------------------------------------------------------------------

/// Width of the transfer id field. Shorter ids are space-padded, longer
/// ones are truncated.
pub const TRANSFER_ID_LEN: usize = 16;

/// Size of the fixed header: id field plus the one-byte data length.
pub const PAYLOAD_HEADER_LEN: usize = TRANSFER_ID_LEN + 1;

/// Largest data section the one-byte length prefix can describe.
pub const MAX_PAYLOAD_DATA_LEN: usize = u8::MAX as usize;

/// Padding byte for the id field.
pub const TRANSFER_ID_PAD: u8 = b' ';

/// Confirmation payload data for an accepted transfer.
pub const CONFIRMED_MARKER: &str = "confirmed";

/// Confirmation payload data for a declined transfer.
pub const REJECTED_MARKER: &str = "rejected";

/// Upper bound on the free-text reason carried in a request. Anything
/// longer would not fit the data section anyway.
pub const MAX_RECEIVER_TYPE_LEN: usize = MAX_PAYLOAD_DATA_LEN;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Discovery loop cadence. Each tick polls the transport for peers and
/// new transfer messages.
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Simulated messages older than this are garbage-collected from the
/// shared registry.
pub const MESSAGE_HORIZON: Duration = Duration::from_secs(10);

/// How long a transfer message stays on air. The radio record is
/// transient; nobody is expected to hear it after this.
pub const TRANSFER_ADVERTISE_DURATION: Duration = Duration::from_secs(3);

/// A pending incoming transfer older than this is auto-confirmed.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);

/// An offer still unanswered after this long is dropped without payout.
/// Covers the seeker's own timeout plus the time its confirmation needs to
/// come back through discovery.
pub const OFFER_EXPIRY: Duration = Duration::from_secs(15);

/// Cadence of the timeout sweep.
pub const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between a confirmation and the ledger settlement of the transfer.
pub const COMPLETION_DELAY: Duration = Duration::from_millis(500);

/// Minimum gap between two "seeker nearby" alerts for the same peer.
pub const ALERT_COOLDOWN: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Points
// ---------------------------------------------------------------------------

/// Points awarded for every completed transfer.
pub const TRANSFER_REWARD_POINTS: u64 = 50;

/// Logical store holding the ledger.
pub const POINTS_STORE: &str = "points";

/// Logical store holding user preferences.
pub const SETTINGS_STORE: &str = "settings";

/// Ledger key for the point balance.
pub const KEY_TOTAL_POINTS: &str = "total_points";

/// Ledger key for the completed-transfer counter.
pub const KEY_TOTAL_TRANSFERS: &str = "total_transfers";

/// Settings key for the persisted [`UserMode`](crate::device::UserMode).
pub const KEY_USER_MODE: &str = "user_mode";

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Prefix for identifiers handed out by the simulated transport.
pub const SIMULATED_DEVICE_PREFIX: &str = "MOCK_DEVICE_";

/// Origin used by injected test requests.
pub const TEST_PEER_ID: &str = "TEST_DEVICE_OTHER";

/// Capacity of the device event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Tunable timing and reward policy.
///
/// Defaults mirror the constants above. Tests and simulations shrink the
/// intervals; production deployments should leave them alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Discovery tick interval in milliseconds.
    pub scan_poll_interval_ms: u64,
    /// Age at which simulated messages are dropped from the registry.
    pub message_horizon_ms: u64,
    /// On-air duration for transfer advertisements.
    pub transfer_advertise_ms: u64,
    /// Pending age that triggers auto-confirmation of incoming offers.
    pub confirmation_timeout_ms: u64,
    /// Pending age at which our own unanswered offers are given up.
    pub offer_expiry_ms: u64,
    /// Timeout sweep interval.
    pub timeout_check_interval_ms: u64,
    /// Confirmation-to-settlement delay.
    pub completion_delay_ms: u64,
    /// Per-peer alert cooldown.
    pub alert_cooldown_ms: u64,
    /// Points per completed transfer.
    pub reward_points: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            scan_poll_interval_ms: SCAN_POLL_INTERVAL.as_millis() as u64,
            message_horizon_ms: MESSAGE_HORIZON.as_millis() as u64,
            transfer_advertise_ms: TRANSFER_ADVERTISE_DURATION.as_millis() as u64,
            confirmation_timeout_ms: CONFIRMATION_TIMEOUT.as_millis() as u64,
            offer_expiry_ms: OFFER_EXPIRY.as_millis() as u64,
            timeout_check_interval_ms: TIMEOUT_CHECK_INTERVAL.as_millis() as u64,
            completion_delay_ms: COMPLETION_DELAY.as_millis() as u64,
            alert_cooldown_ms: ALERT_COOLDOWN.as_millis() as u64,
            reward_points: TRANSFER_REWARD_POINTS,
        }
    }
}

impl ProtocolConfig {
    pub fn scan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scan_poll_interval_ms)
    }

    pub fn transfer_advertise_duration(&self) -> Duration {
        Duration::from_millis(self.transfer_advertise_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }
}
