//! # Transfer Manager
//!
//! Single-writer owner of the active-transfer set. Every operation takes
//! the same lock, applies at most one transition per record, publishes the
//! new snapshot and only then releases the lock. Racing callers (a timeout
//! sweep and a user confirm on the same id, say) are therefore serialized
//! and exactly one of them wins.
//!
//! Completion is the only transition with an outside effect: it credits
//! the [`PointsLedger`] while still holding the lock, so a transfer pays
//! out once or not at all.
//!
//! The confirmation timeout only ever accepts offers made *to* us. An offer
//! we made waits for the seeker's answer and is given up, unpaid, once
//! `offer_expiry_ms` passes without one.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::machine::{TransferBook, TransferError};
use super::request::{new_transfer_id, Direction, ThankYouMessage, TransferRequest};
use crate::clock::{Clock, SharedClock};
use crate::config::ProtocolConfig;
use crate::ledger::PointsLedger;

/// A `PENDING` record that was just answered, with the thank-you message
/// the answer produced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub record: TransferRequest,
    pub thanks: Option<ThankYouMessage>,
}

struct Inner {
    book: TransferBook,
    thanks: Vec<ThankYouMessage>,
}

/// Owns transfer state for one device.
pub struct TransferManager {
    inner: Mutex<Inner>,
    transfers_tx: watch::Sender<Vec<TransferRequest>>,
    thanks_tx: watch::Sender<Vec<ThankYouMessage>>,
    ledger: Arc<PointsLedger>,
    clock: SharedClock,
    timeout_ms: u64,
    offer_expiry_ms: u64,
    retention_ms: u64,
    reward_points: u64,
}

impl TransferManager {
    pub fn new(ledger: Arc<PointsLedger>, clock: SharedClock, config: &ProtocolConfig) -> Self {
        let (transfers_tx, _) = watch::channel(Vec::new());
        let (thanks_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Mutex::new(Inner {
                book: TransferBook::new(),
                thanks: Vec::new(),
            }),
            transfers_tx,
            thanks_tx,
            ledger,
            clock,
            timeout_ms: config.confirmation_timeout_ms,
            offer_expiry_ms: config.offer_expiry_ms,
            retention_ms: config.message_horizon_ms,
            reward_points: config.reward_points,
        }
    }

    pub fn ledger(&self) -> &Arc<PointsLedger> {
        &self.ledger
    }

    // -- Commands ------------------------------------------------------------

    /// Records a request heard from a peer. Returns false for a duplicate id.
    pub fn receive_transfer_request(&self, request: TransferRequest) -> bool {
        let mut inner = self.inner.lock();
        let id = request.id.clone();
        match inner.book.insert(request) {
            Ok(()) => {
                info!(transfer_id = %id, "transfer request received");
                self.publish_transfers(&inner);
                true
            }
            Err(_) => false,
        }
    }

    /// Creates and records our own `PENDING` offer to `peer_id`.
    pub fn create_outgoing(
        &self,
        local_id: &str,
        peer_id: &str,
        receiver_type: &str,
    ) -> TransferRequest {
        let request = TransferRequest::new(
            new_transfer_id(),
            local_id,
            peer_id,
            receiver_type,
            Direction::Outgoing,
            self.clock.now_ms(),
        );
        let mut inner = self.inner.lock();
        // On an id collision the existing record stays.
        if inner.book.insert(request.clone()).is_ok() {
            info!(transfer_id = %request.id, peer = %peer_id, "transfer offered");
            self.publish_transfers(&inner);
        }
        request
    }

    /// `PENDING → CONFIRMED | REJECTED`. Returns false if `id` is unknown or
    /// not pending.
    pub fn confirm_transfer(&self, id: &str, confirmed: bool) -> bool {
        self.try_confirm_transfer(id, confirmed).is_ok()
    }

    /// Like [`confirm_transfer`](Self::confirm_transfer), with the reason on
    /// failure. Returns the updated record and its thank-you.
    pub fn try_confirm_transfer(&self, id: &str, confirmed: bool) -> Result<Answer, TransferError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let record = match inner.book.confirm(id, confirmed, now) {
            Ok(r) => r.clone(),
            Err(e) => {
                debug!(transfer_id = %id, error = %e, "confirm ignored");
                return Err(e);
            }
        };
        info!(transfer_id = %id, status = %record.status, "transfer answered");
        self.publish_transfers(&inner);
        let thanks = confirmed.then(|| ThankYouMessage::for_transfer(&record, now));
        if let Some(message) = &thanks {
            inner.thanks.push(message.clone());
            self.publish_thanks(&inner);
        }
        Ok(Answer { record, thanks })
    }

    /// `CONFIRMED → COMPLETED`: credits the ledger and removes the record.
    /// Returns false, crediting nothing, from any other state.
    pub fn complete_transfer(&self, id: &str) -> bool {
        self.try_complete_transfer(id).is_ok()
    }

    pub fn try_complete_transfer(&self, id: &str) -> Result<TransferRequest, TransferError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let record = match inner.book.complete(id, now) {
            Ok(r) => r,
            Err(e) => {
                debug!(transfer_id = %id, error = %e, "complete ignored");
                return Err(e);
            }
        };
        self.ledger.add_points(self.reward_points);
        info!(transfer_id = %id, reward = self.reward_points, "transfer completed");
        self.publish_transfers(&inner);
        Ok(record)
    }

    /// Auto-confirms every `PENDING` incoming record older than the
    /// confirmation timeout, emitting a thank-you for each.
    pub fn check_timeouts(&self) -> Vec<Answer> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let expired = inner.book.expire(now, self.timeout_ms);
        if expired.is_empty() {
            return Vec::new();
        }
        let answers: Vec<Answer> = expired
            .into_iter()
            .map(|record| {
                info!(transfer_id = %record.id, "transfer auto-confirmed after timeout");
                let message = ThankYouMessage::for_transfer(&record, now);
                inner.thanks.push(message.clone());
                Answer {
                    record,
                    thanks: Some(message),
                }
            })
            .collect();
        self.publish_transfers(&inner);
        self.publish_thanks(&inner);
        answers
    }

    /// Rejects our own offers that went unanswered past the offer expiry.
    /// Nothing is credited for them.
    pub fn expire_offers(&self) -> Vec<TransferRequest> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let abandoned = inner.book.abandon_offers(now, self.offer_expiry_ms);
        if abandoned.is_empty() {
            return abandoned;
        }
        for record in &abandoned {
            info!(
                transfer_id = %record.id,
                peer = %record.counterpart(),
                "offer expired unanswered"
            );
        }
        self.publish_transfers(&inner);
        abandoned
    }

    /// Forgets retired ids older than the message horizon. By then discovery
    /// can no longer deliver the request that created them.
    pub fn prune_retired(&self) -> usize {
        let now = self.clock.now_ms();
        let pruned = self.inner.lock().book.prune_retired(now, self.retention_ms);
        if pruned > 0 {
            debug!(pruned, "retired transfer ids forgotten");
        }
        pruned
    }

    /// Drops `REJECTED` records from the active set.
    pub fn clear_finished(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let removed = inner.book.clear_rejected(now);
        if removed > 0 {
            self.publish_transfers(&inner);
        }
        removed
    }

    pub fn clear_thank_you_messages(&self) {
        let mut inner = self.inner.lock();
        if inner.thanks.is_empty() {
            return;
        }
        inner.thanks.clear();
        self.publish_thanks(&inner);
    }

    // -- Queries -------------------------------------------------------------

    pub fn active_transfers(&self) -> Vec<TransferRequest> {
        self.inner.lock().book.records().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<TransferRequest> {
        self.inner.lock().book.get(id).cloned()
    }

    pub fn thank_you_messages(&self) -> Vec<ThankYouMessage> {
        self.inner.lock().thanks.clone()
    }

    pub fn subscribe_transfers(&self) -> watch::Receiver<Vec<TransferRequest>> {
        self.transfers_tx.subscribe()
    }

    pub fn subscribe_thanks(&self) -> watch::Receiver<Vec<ThankYouMessage>> {
        self.thanks_tx.subscribe()
    }

    fn publish_transfers(&self, inner: &Inner) {
        self.transfers_tx.send_replace(inner.book.records().to_vec());
    }

    fn publish_thanks(&self, inner: &Inner) {
        self.thanks_tx.send_replace(inner.thanks.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
