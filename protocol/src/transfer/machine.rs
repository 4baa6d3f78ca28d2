//! # Transfer Book
//!
//! The active-transfer set and its transitions, with no locking and no
//! side effects. [`TransferManager`](super::TransferManager) wraps it in a
//! mutex and attaches the ledger and subscribers.
//!
//! Completed ids are remembered after removal so a late duplicate of the
//! original request cannot bring a finished transfer back as `PENDING`.
//! They are forgotten once no copy of that request can still be on air.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use super::request::{Direction, TransferRequest, TransferStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a transition was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// No active record has this id.
    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    /// The record exists but the transition is not legal from its state.
    #[error("transfer {id} is {current}, cannot {operation}")]
    InvalidState {
        /// The transfer id.
        id: String,
        /// Status at the time of the call.
        current: TransferStatus,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A record with this id already exists or has completed.
    #[error("duplicate transfer: {0}")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// TransferBook
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct TransferBook {
    active: Vec<TransferRequest>,
    /// Removed ids and when they left the active set.
    retired: HashMap<String, u64>,
}

impl TransferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active records in arrival order.
    pub fn records(&self) -> &[TransferRequest] {
        &self.active
    }

    pub fn get(&self, id: &str) -> Option<&TransferRequest> {
        self.active.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether `id` completed earlier and was removed.
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains_key(id)
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Appends a new record. Ids already active or retired are refused.
    pub fn insert(&mut self, request: TransferRequest) -> Result<(), TransferError> {
        if self.is_retired(&request.id) || self.get(&request.id).is_some() {
            trace!(transfer_id = %request.id, "duplicate transfer ignored");
            return Err(TransferError::Duplicate(request.id));
        }
        debug!(
            transfer_id = %request.id,
            direction = ?request.direction,
            "transfer recorded"
        );
        self.active.push(request);
        Ok(())
    }

    /// `PENDING → CONFIRMED | REJECTED`, stamping `confirmed_at`.
    pub fn confirm(
        &mut self,
        id: &str,
        confirmed: bool,
        now_ms: u64,
    ) -> Result<&TransferRequest, TransferError> {
        let record = self.pending_mut(id, "confirm")?;
        record.status = if confirmed {
            TransferStatus::Confirmed
        } else {
            TransferStatus::Rejected
        };
        record.confirmed_at = Some(now_ms);
        Ok(record)
    }

    /// `CONFIRMED → COMPLETED`. The record leaves the active set and its id
    /// is retired at `now_ms`.
    pub fn complete(&mut self, id: &str, now_ms: u64) -> Result<TransferRequest, TransferError> {
        let idx = self.index_of(id)?;
        let current = self.active[idx].status;
        if current != TransferStatus::Confirmed {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                current,
                operation: "complete",
            });
        }
        let mut record = self.active.remove(idx);
        record.status = TransferStatus::Completed;
        self.retired.insert(record.id.clone(), now_ms);
        Ok(record)
    }

    /// Auto-confirms every `PENDING` incoming record aged at least
    /// `timeout_ms`. Returns the records that changed.
    ///
    /// Our own offers are never confirmed here: only the seeker can accept
    /// them.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<TransferRequest> {
        let mut expired = Vec::new();
        for record in self.active.iter_mut() {
            if record.direction == Direction::Incoming
                && record.is_pending()
                && record.age_ms(now_ms) >= timeout_ms
            {
                record.status = TransferStatus::Confirmed;
                record.confirmed_at = Some(now_ms);
                record.auto_confirmed = true;
                expired.push(record.clone());
            }
        }
        expired
    }

    /// Rejects every `PENDING` outgoing record aged at least `expiry_ms`.
    /// Returns the records that changed.
    pub fn abandon_offers(&mut self, now_ms: u64, expiry_ms: u64) -> Vec<TransferRequest> {
        let mut abandoned = Vec::new();
        for record in self.active.iter_mut() {
            if record.direction == Direction::Outgoing
                && record.is_pending()
                && record.age_ms(now_ms) >= expiry_ms
            {
                record.status = TransferStatus::Rejected;
                record.confirmed_at = Some(now_ms);
                abandoned.push(record.clone());
            }
        }
        abandoned
    }

    /// Removes `REJECTED` records, retiring their ids at `now_ms`. Returns
    /// how many were removed.
    pub fn clear_rejected(&mut self, now_ms: u64) -> usize {
        let before = self.active.len();
        let retired = &mut self.retired;
        self.active.retain(|r| {
            if r.status == TransferStatus::Rejected {
                retired.insert(r.id.clone(), now_ms);
                false
            } else {
                true
            }
        });
        before - self.active.len()
    }

    /// Forgets ids retired more than `retention_ms` before `now_ms`.
    /// Returns how many were forgotten.
    pub fn prune_retired(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.retired.len();
        let cutoff = now_ms.saturating_sub(retention_ms);
        self.retired.retain(|_, at| *at >= cutoff);
        before - self.retired.len()
    }

    fn index_of(&self, id: &str) -> Result<usize, TransferError> {
        self.active
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| TransferError::UnknownTransfer(id.to_string()))
    }

    fn pending_mut(
        &mut self,
        id: &str,
        operation: &'static str,
    ) -> Result<&mut TransferRequest, TransferError> {
        let idx = self.index_of(id)?;
        let record = &mut self.active[idx];
        if !record.is_pending() {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                current: record.status,
                operation,
            });
        }
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::request::Direction;

    fn pending(id: &str, created_at: u64) -> TransferRequest {
        TransferRequest::new(id, "A", "B", "pregnant", Direction::Incoming, created_at)
    }

    fn offer(id: &str, created_at: u64) -> TransferRequest {
        TransferRequest::new(id, "A", "B", "pregnant", Direction::Outgoing, created_at)
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut book = TransferBook::new();
        book.insert(pending("t1", 0)).unwrap();
        assert_eq!(
            book.insert(pending("t1", 5)),
            Err(TransferError::Duplicate("t1".into()))
        );
        assert_eq!(book.len(), 1);
        assert_eq!(book.get("t1").unwrap().created_at, 0);
    }

    #[test]
    fn confirm_stamps_and_transitions() {
        let mut book = TransferBook::new();
        book.insert(pending("t1", 0)).unwrap();
        let r = book.confirm("t1", true, 42).unwrap();
        assert_eq!(r.status, TransferStatus::Confirmed);
        assert_eq!(r.confirmed_at, Some(42));
        assert!(!r.auto_confirmed);
    }

    #[test]
    fn reject_is_terminal() {
        let mut book = TransferBook::new();
        book.insert(pending("t1", 0)).unwrap();
        book.confirm("t1", false, 1).unwrap();
        assert!(matches!(
            book.confirm("t1", true, 2),
            Err(TransferError::InvalidState {
                current: TransferStatus::Rejected,
                ..
            })
        ));
        assert!(book.complete("t1", 9).is_err());
        assert_eq!(book.get("t1").unwrap().status, TransferStatus::Rejected);
    }

    #[test]
    fn complete_requires_confirmed() {
        let mut book = TransferBook::new();
        book.insert(pending("t1", 0)).unwrap();
        assert!(matches!(
            book.complete("t1", 9),
            Err(TransferError::InvalidState {
                current: TransferStatus::Pending,
                operation: "complete",
                ..
            })
        ));
        book.confirm("t1", true, 1).unwrap();
        let done = book.complete("t1", 9).unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert!(book.is_empty());
        assert!(book.is_retired("t1"));
    }

    #[test]
    fn completed_id_cannot_come_back() {
        let mut book = TransferBook::new();
        book.insert(pending("t1", 0)).unwrap();
        book.confirm("t1", true, 1).unwrap();
        book.complete("t1", 9).unwrap();
        assert!(book.insert(pending("t1", 2)).is_err());
        assert!(book.is_empty());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut book = TransferBook::new();
        assert_eq!(
            book.confirm("nope", true, 0).unwrap_err(),
            TransferError::UnknownTransfer("nope".into())
        );
        assert_eq!(
            book.complete("nope", 0).unwrap_err(),
            TransferError::UnknownTransfer("nope".into())
        );
    }

    #[test]
    fn expire_only_touches_old_pending_records() {
        let now = 100_000;
        let mut book = TransferBook::new();
        book.insert(pending("old", now - 6_000)).unwrap();
        book.insert(pending("young", now - 4_000)).unwrap();
        book.insert(pending("answered", now - 9_000)).unwrap();
        book.confirm("answered", false, now - 8_000).unwrap();

        let expired = book.expire(now, 5_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");

        let old = book.get("old").unwrap();
        assert_eq!(old.status, TransferStatus::Confirmed);
        assert!(old.auto_confirmed);
        assert_eq!(old.confirmed_at, Some(now));

        assert!(book.get("young").unwrap().is_pending());
        assert_eq!(book.get("answered").unwrap().status, TransferStatus::Rejected);

        // A second sweep finds nothing new.
        assert!(book.expire(now, 5_000).is_empty());
    }

    #[test]
    fn clear_rejected_keeps_live_records() {
        let mut book = TransferBook::new();
        book.insert(pending("a", 0)).unwrap();
        book.insert(pending("b", 0)).unwrap();
        book.confirm("b", false, 1).unwrap();
        assert_eq!(book.clear_rejected(5), 1);
        assert_eq!(book.len(), 1);
        assert!(book.insert(pending("b", 3)).is_err());
    }

    #[test]
    fn expire_leaves_our_own_offers_pending() {
        let now = 100_000;
        let mut book = TransferBook::new();
        book.insert(offer("mine", now - 60_000)).unwrap();
        assert!(book.expire(now, 5_000).is_empty());
        assert!(book.get("mine").unwrap().is_pending());
        assert!(book.complete("mine", now).is_err());
    }

    #[test]
    fn abandon_rejects_only_stale_offers() {
        let now = 100_000;
        let mut book = TransferBook::new();
        book.insert(offer("stale", now - 15_000)).unwrap();
        book.insert(offer("fresh", now - 14_000)).unwrap();
        book.insert(pending("theirs", now - 60_000)).unwrap();

        let abandoned = book.abandon_offers(now, 15_000);
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, "stale");

        let stale = book.get("stale").unwrap();
        assert_eq!(stale.status, TransferStatus::Rejected);
        assert_eq!(stale.confirmed_at, Some(now));
        assert!(!stale.auto_confirmed);
        assert!(book.get("fresh").unwrap().is_pending());
        assert!(book.get("theirs").unwrap().is_pending());

        // A confirmation arriving afterwards finds nothing to accept.
        assert!(book.confirm("stale", true, now + 1).is_err());
    }

    #[test]
    fn retired_ids_are_forgotten_after_retention() {
        let mut book = TransferBook::new();
        for (id, at) in [("early", 1_000), ("late", 8_000)] {
            book.insert(pending(id, 0)).unwrap();
            book.confirm(id, true, at).unwrap();
            book.complete(id, at).unwrap();
        }
        assert_eq!(book.retired_len(), 2);

        assert_eq!(book.prune_retired(11_000, 10_000), 0);
        assert_eq!(book.prune_retired(11_001, 10_000), 1);
        assert!(!book.is_retired("early"));
        assert!(book.is_retired("late"));
        assert!(book.insert(pending("early", 11_001)).is_ok());
    }
}
