//! # Points Ledger
//!
//! A point balance and a completed-transfer counter, persisted in the
//! `points` store under `total_points` and `total_transfers`.
//!
//! Every mutation holds one lock from read to publish, so concurrent
//! callers are serialized and subscribers see snapshots in the order the
//! mutations were applied. Persistence is fire-and-forget: the in-memory
//! state is authoritative and a failed write is logged, not returned.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::rewards::Reward;
use crate::config::{KEY_TOTAL_POINTS, KEY_TOTAL_TRANSFERS};
use crate::storage::kv::{KeyValueStore, SharedStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Attempted to spend more than the balance.
    #[error("insufficient points: available {available}, requested {requested}")]
    InsufficientPoints {
        /// The current balance.
        available: u64,
        /// The amount that was requested.
        requested: u64,
    },

    /// The backing store failed.
    #[error("ledger storage error: {0}")]
    Storage(#[from] StoreError),

    /// A credit would exceed `u64::MAX`.
    #[error("points overflow: current {current}, credit {credit}")]
    Overflow {
        /// The balance before the failed credit.
        current: u64,
        /// The amount that caused the overflow.
        credit: u64,
    },
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Ledger state as published to subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsSnapshot {
    pub total_points: u64,
    pub total_transfers: u64,
}

// ---------------------------------------------------------------------------
// PointsLedger
// ---------------------------------------------------------------------------

/// The device's point balance.
pub struct PointsLedger {
    store: SharedStore,
    state: Mutex<PointsSnapshot>,
    tx: watch::Sender<PointsSnapshot>,
}

impl PointsLedger {
    /// Loads the ledger from `store`. Missing keys start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the store cannot be read or holds
    /// a value that is not a `u64`.
    pub fn open(store: SharedStore) -> Result<Self, LedgerError> {
        let snapshot = PointsSnapshot {
            total_points: store.get_u64(KEY_TOTAL_POINTS)?.unwrap_or(0),
            total_transfers: store.get_u64(KEY_TOTAL_TRANSFERS)?.unwrap_or(0),
        };
        debug!(
            points = snapshot.total_points,
            transfers = snapshot.total_transfers,
            "ledger loaded"
        );
        let (tx, _) = watch::channel(snapshot);
        Ok(Self {
            store,
            state: Mutex::new(snapshot),
            tx,
        })
    }

    pub fn snapshot(&self) -> PointsSnapshot {
        *self.state.lock()
    }

    pub fn total_points(&self) -> u64 {
        self.state.lock().total_points
    }

    pub fn total_transfers(&self) -> u64 {
        self.state.lock().total_transfers
    }

    pub fn subscribe(&self) -> watch::Receiver<PointsSnapshot> {
        self.tx.subscribe()
    }

    /// Credits `amount` points for one completed transfer. Never fails.
    ///
    /// The balance saturates at `u64::MAX`.
    pub fn add_points(&self, amount: u64) -> PointsSnapshot {
        let mut state = self.state.lock();
        let total_points = match state.total_points.checked_add(amount) {
            Some(total) => total,
            None => {
                let err = LedgerError::Overflow {
                    current: state.total_points,
                    credit: amount,
                };
                warn!(error = %err, "points saturated");
                u64::MAX
            }
        };
        state.total_points = total_points;
        state.total_transfers = state.total_transfers.saturating_add(1);

        self.persist(&state);
        self.tx.send_replace(*state);
        info!(
            amount,
            points = state.total_points,
            transfers = state.total_transfers,
            "points awarded"
        );
        *state
    }

    /// Spends `amount` points. Returns false, leaving the balance alone,
    /// if there are not enough.
    pub fn use_points(&self, amount: u64) -> bool {
        self.try_use_points(amount).is_ok()
    }

    /// Like [`use_points`](Self::use_points), with the reason on failure.
    /// Returns the new balance.
    pub fn try_use_points(&self, amount: u64) -> Result<u64, LedgerError> {
        let mut state = self.state.lock();
        if state.total_points < amount {
            debug!(
                available = state.total_points,
                requested = amount,
                "spend refused"
            );
            return Err(LedgerError::InsufficientPoints {
                available: state.total_points,
                requested: amount,
            });
        }
        state.total_points -= amount;

        self.persist(&state);
        self.tx.send_replace(*state);
        info!(amount, points = state.total_points, "points spent");
        Ok(state.total_points)
    }

    /// Whether the balance covers `reward`.
    pub fn can_redeem(&self, reward: Reward) -> bool {
        self.total_points() >= reward.cost()
    }

    /// Spends the cost of `reward`.
    pub fn redeem(&self, reward: Reward) -> Result<u64, LedgerError> {
        let balance = self.try_use_points(reward.cost())?;
        info!(reward = %reward, "reward redeemed");
        Ok(balance)
    }

    fn persist(&self, state: &PointsSnapshot) {
        let result = self
            .store
            .put_u64(KEY_TOTAL_POINTS, state.total_points)
            .and_then(|_| self.store.put_u64(KEY_TOTAL_TRANSFERS, state.total_transfers));
        if let Err(e) = result {
            warn!(error = %e, "ledger write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
