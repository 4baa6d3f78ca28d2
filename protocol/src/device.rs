//! # Seat Device
//!
//! Wires one device together and exposes what the UI talks to.
//!
//! ```text
//!  Transport ──► DiscoveryLoop ──mpsc──► event pump ──► TransferManager ──► PointsLedger
//!      ▲                                     │                 ▲
//!      └──────── advertise request/confirm ◄─┴── UI commands ──┘
//!                                            timeout sweeper ──┘
//! ```
//!
//! Three background tasks run per device once [`SeatDevice::start`] is
//! called: the discovery poll, the discovery event pump, and the timeout
//! sweeper. Confirmations schedule `complete_transfer` after the
//! completion delay on their own short-lived task.
//!
//! A giver is paid only when the seeker's confirmation comes back. The
//! sweeper auto-confirms offers we received; offers we made are given up
//! after the offer expiry if no answer arrived.
//!
//! Observable state goes out through `watch` channels (transfers, points,
//! thank-you messages) and a `broadcast` channel of [`DeviceEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SharedClock};
use crate::codec::{self, TransferPayload};
use crate::config::{ProtocolConfig, EVENT_CHANNEL_CAPACITY};
use crate::discovery::{DiscoveryEvent, DiscoveryLoop, DiscoveryService};
use crate::ledger::{LedgerError, PointsLedger, PointsSnapshot, Reward};
use crate::storage::{SeatDb, Settings, SettingsStore, SharedStore, StoreError};
use crate::transfer::{
    Answer, Direction, ThankYouMessage, TransferManager, TransferRequest, TransferStatus,
};
use crate::transport::{ServiceTag, SharedTransport, TransportKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the user is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    /// Looking for a seat: advertise presence so givers can find us.
    NeedSeat,
    /// Sitting and willing to give the seat up: scan only.
    #[default]
    Available,
}

/// Something the UI should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A seeker is advertising nearby. Throttled per peer.
    SeekerNearby { peer_id: String },
    /// We offered our seat to a peer.
    TransferInitiated { transfer: TransferRequest },
    /// A peer offered us their seat.
    TransferRequested { transfer: TransferRequest },
    /// A transfer was accepted, by someone or by the timeout.
    TransferConfirmed { transfer_id: String, auto: bool },
    /// A transfer was declined.
    TransferRejected { transfer_id: String },
    /// Our offer went unanswered and was given up.
    TransferExpired { transfer_id: String },
    /// A transfer settled and paid out.
    TransferCompleted {
        transfer_id: String,
        awarded: u64,
        total_points: u64,
    },
    /// A thank-you message was produced.
    ThankYou { message: ThankYouMessage },
    /// Points left the balance.
    PointsSpent { amount: u64, balance: u64 },
    /// The user switched modes.
    ModeChanged { mode: UserMode },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub transport: TransportKind,
    pub mode: UserMode,
    pub scanning: bool,
    pub active_transfers: usize,
    pub points: PointsSnapshot,
}

/// Errors raised while assembling a device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Alert throttle
// ---------------------------------------------------------------------------

/// At most one alert per peer per cooldown.
#[derive(Debug)]
pub struct AlertThrottle {
    cooldown_ms: u64,
    last: DashMap<String, u64>,
}

impl AlertThrottle {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last: DashMap::new(),
        }
    }

    /// True if `peer` may be alerted at `now_ms`. Records the alert.
    pub fn should_alert(&self, peer: &str, now_ms: u64) -> bool {
        match self.last.entry(peer.to_string()) {
            Entry::Occupied(mut e) => {
                if now_ms.saturating_sub(*e.get()) >= self.cooldown_ms {
                    e.insert(now_ms);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now_ms);
                true
            }
        }
    }

    /// Forgets peers whose cooldown has run out by `now_ms`.
    pub fn prune(&self, now_ms: u64) {
        self.last
            .retain(|_, last| now_ms.saturating_sub(*last) < self.cooldown_ms);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    transport: SharedTransport,
    discovery: DiscoveryService,
    transfers: Arc<TransferManager>,
    ledger: Arc<PointsLedger>,
    settings: SettingsStore,
    prefs: Mutex<Settings>,
    config: ProtocolConfig,
    clock: SharedClock,
    events: broadcast::Sender<DeviceEvent>,
    alerts: AlertThrottle,
}

impl Shared {
    fn local_id(&self) -> &str {
        self.transport.local_id()
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn advertise_confirmation(&self, transfer_id: &str, confirmed: bool) {
        self.transport.advertise(
            ServiceTag::TransferConfirm,
            TransferPayload::confirmation(transfer_id, confirmed).encode(),
            self.config.transfer_advertise_duration(),
        );
    }

    fn apply_mode(&self, mode: UserMode) {
        match mode {
            UserMode::NeedSeat => self.transport.start_advertising(),
            UserMode::Available => self.transport.stop_advertising(),
        }
    }

    fn handle_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound { peer_id } => {
                let prefs = self.prefs.lock().clone();
                if prefs.user_mode != UserMode::Available || !prefs.enable_notifications {
                    return;
                }
                if self.alerts.should_alert(&peer_id, self.clock.now_ms()) {
                    info!(peer = %peer_id, "seeker nearby");
                    self.emit(DeviceEvent::SeekerNearby { peer_id });
                }
            }
            DiscoveryEvent::RequestReceived {
                transfer_id,
                sender_id,
                receiver_type,
            } => {
                let request = TransferRequest::new(
                    transfer_id,
                    sender_id,
                    self.local_id(),
                    receiver_type,
                    Direction::Incoming,
                    self.clock.now_ms(),
                );
                if self.transfers.receive_transfer_request(request.clone()) {
                    self.emit(DeviceEvent::TransferRequested { transfer: request });
                }
            }
            DiscoveryEvent::ConfirmationReceived {
                transfer_id,
                sender_id,
                confirmed,
            } => self.on_confirmation_received(&transfer_id, &sender_id, confirmed),
        }
    }

    fn on_confirmation_received(
        self: &Arc<Self>,
        transfer_id: &str,
        sender_id: &str,
        confirmed: bool,
    ) {
        let Some(record) = self.transfers.get(transfer_id) else {
            debug!(transfer_id, "confirmation for unknown transfer");
            return;
        };
        if record.direction != Direction::Outgoing || record.counterpart() != sender_id {
            debug!(transfer_id, sender = %sender_id, "confirmation not addressed to us");
            return;
        }
        match self.transfers.try_confirm_transfer(transfer_id, confirmed) {
            Ok(answer) => self.after_answer(answer),
            Err(e) => debug!(transfer_id, error = %e, "late confirmation ignored"),
        }
    }

    /// Events and scheduling that follow any `PENDING` → answered transition.
    fn after_answer(self: &Arc<Self>, answer: Answer) {
        let Answer { record, thanks } = answer;
        match record.status {
            TransferStatus::Confirmed => {
                self.emit(DeviceEvent::TransferConfirmed {
                    transfer_id: record.id.clone(),
                    auto: record.auto_confirmed,
                });
                if let Some(message) = thanks {
                    self.emit(DeviceEvent::ThankYou { message });
                }
                self.schedule_completion(record.id);
            }
            TransferStatus::Rejected => {
                self.emit(DeviceEvent::TransferRejected {
                    transfer_id: record.id.clone(),
                });
            }
            TransferStatus::Pending | TransferStatus::Completed => {}
        }
    }

    fn schedule_completion(self: &Arc<Self>, transfer_id: String) {
        let shared = Arc::clone(self);
        let delay = self.config.completion_delay();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.complete(&transfer_id);
                });
            }
            Err(_) => {
                debug!(%transfer_id, "no runtime, completing immediately");
                shared.complete(&transfer_id);
            }
        }
    }

    fn complete(&self, transfer_id: &str) {
        if self.transfers.complete_transfer(transfer_id) {
            self.emit(DeviceEvent::TransferCompleted {
                transfer_id: transfer_id.to_string(),
                awarded: self.config.reward_points,
                total_points: self.ledger.total_points(),
            });
        }
    }

    fn sweep_timeouts(self: &Arc<Self>) {
        for record in self.transfers.expire_offers() {
            self.emit(DeviceEvent::TransferExpired {
                transfer_id: record.id,
            });
        }
        self.transfers.prune_retired();
        self.alerts.prune(self.clock.now_ms());

        if !self.prefs.lock().auto_confirm {
            return;
        }
        for answer in self.transfers.check_timeouts() {
            self.advertise_confirmation(&answer.record.id, true);
            self.after_answer(answer);
        }
    }
}

// ---------------------------------------------------------------------------
// SeatDevice
// ---------------------------------------------------------------------------

/// One device taking part in the protocol.
pub struct SeatDevice {
    shared: Arc<Shared>,
    discovery_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SeatDevice {
    /// Assembles a device from its collaborators. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        transport: SharedTransport,
        points_store: SharedStore,
        settings_store: SharedStore,
        clock: SharedClock,
        config: ProtocolConfig,
    ) -> Result<Self, DeviceError> {
        let ledger = Arc::new(PointsLedger::open(points_store)?);
        let transfers = Arc::new(TransferManager::new(ledger.clone(), clock.clone(), &config));
        let settings = SettingsStore::new(settings_store);
        let prefs = settings.load();

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let discovery = Arc::new(DiscoveryLoop::new(
            transport.clone(),
            clock.clone(),
            std::time::Duration::from_millis(config.message_horizon_ms),
            discovery_tx,
        ));
        let discovery = DiscoveryService::new(discovery, config.scan_poll_interval());

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            device = %transport.local_id(),
            transport = ?transport.kind(),
            mode = ?prefs.user_mode,
            "device assembled"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                discovery,
                transfers,
                ledger,
                settings,
                prefs: Mutex::new(prefs),
                alerts: AlertThrottle::new(config.alert_cooldown_ms),
                config,
                clock,
                events,
            }),
            discovery_rx: Mutex::new(Some(discovery_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// A device whose ledger and settings live in `db`.
    pub fn with_db(
        transport: SharedTransport,
        db: &SeatDb,
        clock: SharedClock,
        config: ProtocolConfig,
    ) -> Result<Self, DeviceError> {
        Self::new(
            transport,
            Arc::new(db.points()),
            Arc::new(db.settings()),
            clock,
            config,
        )
    }

    /// Starts scanning, restores the persisted mode and spawns the
    /// background tasks. Returns false if already started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let shared = self.shared.clone();
        shared.apply_mode(shared.prefs.lock().user_mode);
        shared.discovery.start();

        let mut tasks = self.tasks.lock();
        if let Some(mut rx) = self.discovery_rx.lock().take() {
            let shared = self.shared.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => shared.handle_discovery_event(event),
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("event pump stopped");
            }));
        }

        let sweeper = self.shared.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.shared.config.timeout_check_interval();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => sweeper.sweep_timeouts(),
                    _ = shutdown.changed() => break,
                }
            }
            debug!("timeout sweeper stopped");
        }));

        info!(device = %self.device_id(), "device started");
        true
    }

    /// Stops the background tasks, scanning and advertising.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.shared.discovery.stop();
        self.shared.transport.shutdown();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(device = %self.device_id(), "device stopped");
    }

    // -- Commands ------------------------------------------------------------

    /// Offers our seat to `peer_id`. Returns the new transfer id.
    pub fn initiate_transfer(&self, peer_id: &str, receiver_type: &str) -> String {
        let record = self
            .shared
            .transfers
            .create_outgoing(self.device_id(), peer_id, receiver_type);
        self.shared.transport.advertise(
            ServiceTag::TransferRequest,
            codec::encode(&record.id, receiver_type),
            self.shared.config.transfer_advertise_duration(),
        );
        self.shared.emit(DeviceEvent::TransferInitiated {
            transfer: record.clone(),
        });
        record.id
    }

    /// Answers a pending transfer. Returns false if `transfer_id` is
    /// unknown or already answered.
    pub fn confirm(&self, transfer_id: &str, confirmed: bool) -> bool {
        let answer = match self
            .shared
            .transfers
            .try_confirm_transfer(transfer_id, confirmed)
        {
            Ok(answer) => answer,
            Err(e) => {
                debug!(transfer_id, error = %e, "confirm refused");
                return false;
            }
        };
        if answer.record.direction == Direction::Incoming {
            self.shared.advertise_confirmation(transfer_id, confirmed);
        }
        self.shared.after_answer(answer);
        true
    }

    /// Spends points. Returns false if the balance is short.
    pub fn spend(&self, amount: u64) -> bool {
        match self.shared.ledger.try_use_points(amount) {
            Ok(balance) => {
                self.shared.emit(DeviceEvent::PointsSpent { amount, balance });
                true
            }
            Err(_) => false,
        }
    }

    pub fn redeem(&self, reward: Reward) -> Result<u64, LedgerError> {
        let balance = self.shared.ledger.redeem(reward)?;
        self.shared.emit(DeviceEvent::PointsSpent {
            amount: reward.cost(),
            balance,
        });
        Ok(balance)
    }

    /// Switches mode, persisting it. Takes effect immediately if started.
    pub fn set_mode(&self, mode: UserMode) {
        {
            let mut prefs = self.shared.prefs.lock();
            if prefs.user_mode == mode {
                return;
            }
            prefs.user_mode = mode;
        }
        if let Err(e) = self.shared.settings.set_user_mode(mode) {
            warn!(error = %e, "failed to persist user mode");
        }
        if self.started.load(Ordering::SeqCst) {
            self.shared.apply_mode(mode);
        }
        info!(?mode, "mode changed");
        self.shared.emit(DeviceEvent::ModeChanged { mode });
    }

    /// Replaces all preferences, persisting them.
    pub fn update_settings(&self, settings: Settings) {
        let mode = settings.user_mode;
        {
            let mut prefs = self.shared.prefs.lock();
            // The mode switch goes through set_mode below.
            *prefs = Settings {
                user_mode: prefs.user_mode,
                ..settings
            };
            if let Err(e) = self.shared.settings.save(&prefs) {
                warn!(error = %e, "failed to persist settings");
            }
        }
        self.set_mode(mode);
    }

    pub fn clear_thank_you_messages(&self) {
        self.shared.transfers.clear_thank_you_messages();
    }

    pub fn clear_finished(&self) -> usize {
        self.shared.transfers.clear_finished()
    }

    // -- Queries -------------------------------------------------------------

    pub fn device_id(&self) -> &str {
        self.shared.local_id()
    }

    pub fn mode(&self) -> UserMode {
        self.shared.prefs.lock().user_mode
    }

    pub fn settings(&self) -> Settings {
        self.shared.prefs.lock().clone()
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.shared.transfers
    }

    pub fn ledger(&self) -> &Arc<PointsLedger> {
        &self.shared.ledger
    }

    pub fn active_transfers(&self) -> Vec<TransferRequest> {
        self.shared.transfers.active_transfers()
    }

    pub fn thank_you_messages(&self) -> Vec<ThankYouMessage> {
        self.shared.transfers.thank_you_messages()
    }

    pub fn points(&self) -> PointsSnapshot {
        self.shared.ledger.snapshot()
    }

    /// Broadcast records discovery has dropped as undecodable.
    pub fn dropped_payloads(&self) -> u64 {
        self.shared.discovery.discovery().dropped_payloads()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id().to_string(),
            transport: self.shared.transport.kind(),
            mode: self.mode(),
            scanning: self.shared.discovery.is_scanning(),
            active_transfers: self.shared.transfers.active_transfers().len(),
            points: self.points(),
        }
    }

    pub fn subscribe_transfers(&self) -> watch::Receiver<Vec<TransferRequest>> {
        self.shared.transfers.subscribe_transfers()
    }

    pub fn subscribe_points(&self) -> watch::Receiver<PointsSnapshot> {
        self.shared.ledger.subscribe()
    }

    pub fn subscribe_thanks(&self) -> watch::Receiver<Vec<ThankYouMessage>> {
        self.shared.transfers.subscribe_thanks()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Device events as a stream. Events missed by a slow consumer are
    /// skipped.
    pub fn event_stream(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        stream::unfold(self.subscribe_events(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Feeds a discovery event directly, bypassing the transport.
    pub fn handle_discovery_event(&self, event: DiscoveryEvent) {
        self.shared.handle_discovery_event(event);
    }

    /// Runs one timeout sweep now.
    pub fn sweep_timeouts(&self) {
        self.shared.sweep_timeouts();
    }
}

impl Drop for SeatDevice {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
