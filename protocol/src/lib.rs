// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # SeatPass Protocol — Core Library
//!
//! Two phones on a train find each other over short-range radio. One user
//! needs a seat, the other offers theirs, and both end up with points once
//! the handshake settles. This crate is that handshake.
//!
//! ## Architecture
//!
//! Leaf to root:
//!
//! - **transport** — broadcast advertise/scan, with a real-radio backend and
//!   an in-process simulated one sharing a registry.
//! - **codec** — the 17-byte-header payload that fits in manufacturer data.
//! - **discovery** — polls the transport, dedups, emits typed events.
//! - **transfer** — the PENDING → CONFIRMED/REJECTED → COMPLETED machine,
//!   timeout auto-confirmation, thank-you messages.
//! - **ledger** — persisted points and transfer count, reward catalog.
//! - **device** — wires the above together for one device and exposes the
//!   UI command surface and observable streams.
//! - **storage** — sled-backed key/value stores for points and settings.
//! - **config** / **clock** — constants, tunables, injectable time.
//!
//! ## Ground Rules
//!
//! 1. The radio is lossy and at-most-once. Nothing here retries.
//! 2. A transfer pays out exactly once, or not at all.
//! 3. Malformed input from the air is dropped and logged, never a panic.

pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod ledger;
pub mod storage;
pub mod transfer;
pub mod transport;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::ProtocolConfig;
pub use device::{DeviceEvent, DeviceStatus, SeatDevice, UserMode};
pub use discovery::DiscoveryEvent;
pub use ledger::{PointsLedger, PointsSnapshot, Reward};
pub use transfer::{ThankYouMessage, TransferManager, TransferRequest, TransferStatus};
pub use transport::{select_transport, SimulatedRegistry, SimulatedTransport, Transport};
