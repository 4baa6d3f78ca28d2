//! # Discovery Loop
//!
//! Polls a [`Transport`] on a fixed cadence and turns what it hears into
//! typed [`DiscoveryEvent`]s.
//!
//! ## Tick
//!
//! 1. Report every advertising peer other than ourselves.
//! 2. Fetch transfer records with `timestamp >= cursor`, then move the
//!    cursor to the time of the fetch.
//! 3. Drop self-originated records, undecodable payloads and payloads
//!    without a transfer id.
//! 4. Drop records already dispatched, keyed by `(tag, transfer_id, origin)`.
//! 5. Classify by tag and dispatch.
//! 6. Prune the transport and the seen cache at the message horizon.
//!
//! The inclusive cursor can hand back a record that was already returned by
//! the previous fetch when both happen in the same millisecond. The seen
//! cache is what guarantees a record is dispatched at most once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SharedClock};
use crate::codec;
use crate::transport::{ServiceTag, SharedTransport};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something the discovery loop heard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// A nearby device is advertising presence (its user needs a seat).
    PeerFound { peer_id: String },
    /// A peer offered us a seat.
    RequestReceived {
        transfer_id: String,
        sender_id: String,
        receiver_type: String,
    },
    /// A peer answered one of our requests.
    ConfirmationReceived {
        transfer_id: String,
        sender_id: String,
        confirmed: bool,
    },
}

/// Identity of a dispatched record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MessageKey {
    tag: ServiceTag,
    transfer_id: String,
    origin: String,
}

// ---------------------------------------------------------------------------
// DiscoveryLoop
// ---------------------------------------------------------------------------

/// One device's discovery state: a cursor and a seen cache.
pub struct DiscoveryLoop {
    transport: SharedTransport,
    clock: SharedClock,
    horizon_ms: u64,
    cursor: AtomicU64,
    seen: DashMap<MessageKey, u64>,
    dropped: AtomicU64,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl DiscoveryLoop {
    pub fn new(
        transport: SharedTransport,
        clock: SharedClock,
        horizon: Duration,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        let cursor = AtomicU64::new(clock.now_ms());
        Self {
            transport,
            clock,
            horizon_ms: horizon.as_millis() as u64,
            cursor,
            seen: DashMap::new(),
            dropped: AtomicU64::new(0),
            events,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Records dropped because they failed to decode.
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Moves the cursor to now. Records older than this are never fetched.
    pub fn reset_cursor(&self) {
        self.cursor.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    /// Runs one poll. Returns how many events were dispatched.
    pub fn tick(&self) -> usize {
        let local_id = self.transport.local_id();
        let mut dispatched = 0;

        for peer_id in self.transport.advertising_peers() {
            if peer_id == local_id {
                continue;
            }
            if self.emit(DiscoveryEvent::PeerFound { peer_id }) {
                dispatched += 1;
            }
        }

        let now = self.clock.now_ms();
        let since = self.cursor.swap(now, Ordering::SeqCst);
        let records = self.transport.messages_since(since);
        trace!(since, count = records.len(), "polled transfer records");

        for record in records {
            if record.origin == local_id {
                continue;
            }

            let payload = match codec::decode(&record.payload) {
                Ok(p) => p,
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        origin = %record.origin,
                        error = %e,
                        "dropping undecodable transfer record"
                    );
                    continue;
                }
            };
            if payload.transfer_id.is_empty() {
                debug!(origin = %record.origin, "dropping transfer record without id");
                continue;
            }

            let key = MessageKey {
                tag: record.tag,
                transfer_id: payload.transfer_id.clone(),
                origin: record.origin.clone(),
            };
            if self.seen.insert(key, record.timestamp_ms).is_some() {
                trace!(transfer_id = %payload.transfer_id, "duplicate transfer record");
                continue;
            }

            let event = match record.tag {
                ServiceTag::TransferRequest => DiscoveryEvent::RequestReceived {
                    transfer_id: payload.transfer_id,
                    sender_id: record.origin,
                    receiver_type: payload.data,
                },
                ServiceTag::TransferConfirm => DiscoveryEvent::ConfirmationReceived {
                    confirmed: payload.is_confirmed(),
                    transfer_id: payload.transfer_id,
                    sender_id: record.origin,
                },
                ServiceTag::Presence => continue,
            };
            if self.emit(event) {
                dispatched += 1;
            }
        }

        let cutoff = now.saturating_sub(self.horizon_ms);
        self.transport.prune(cutoff);
        self.seen.retain(|_, ts| *ts >= cutoff);

        dispatched
    }

    /// Polls every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(device = %self.transport.local_id(), "discovery loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            self.tick();
        }
        info!(device = %self.transport.local_id(), "discovery loop stopped");
    }

    fn emit(&self, event: DiscoveryEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

// ---------------------------------------------------------------------------
// DiscoveryService
// ---------------------------------------------------------------------------

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the scanning lifecycle: transport scanning plus the polling task.
pub struct DiscoveryService {
    discovery: Arc<DiscoveryLoop>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(discovery: Arc<DiscoveryLoop>, interval: Duration) -> Self {
        Self {
            discovery,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn discovery(&self) -> &Arc<DiscoveryLoop> {
        &self.discovery
    }

    pub fn is_scanning(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts scanning. Returns false if already scanning.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        self.discovery.transport.start_scanning();
        self.discovery.reset_cursor();

        let (tx, rx) = watch::channel(false);
        let discovery = self.discovery.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move { discovery.run(interval, rx).await });
        *running = Some(Running { shutdown: tx, task });
        true
    }

    /// Stops scanning. Returns false if not scanning.
    pub fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        let _ = running.shutdown.send(true);
        self.discovery.transport.stop_scanning();
        drop(running.task);
        true
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
            running.task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
