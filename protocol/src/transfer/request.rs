//! Transfer records and thank-you messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TRANSFER_ID_LEN;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Where a transfer is in its lifecycle.
///
/// ```text
/// PENDING ──confirm(true)/timeout──► CONFIRMED ──complete──► COMPLETED (removed)
///    │
///    └──confirm(false)/offer expiry─► REJECTED
/// ```
///
/// The timeout applies to incoming records only, the offer expiry to
/// outgoing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Rejected,
    Completed,
}

impl TransferStatus {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// Which side of the handshake this copy of the record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We offered the seat.
    Outgoing,
    /// We were offered the seat.
    Incoming,
}

// ---------------------------------------------------------------------------
// TransferRequest
// ---------------------------------------------------------------------------

/// One handshake, from one device's point of view.
///
/// `confirmed_at` is `Some` exactly when `status` is not `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: String,
    pub sender_device_id: String,
    pub receiver_device_id: String,
    /// Free-text reason (e.g. "pregnant", "elderly").
    pub receiver_type: String,
    pub status: TransferStatus,
    /// Unix ms.
    pub created_at: u64,
    /// Unix ms of the confirm/reject/timeout transition.
    pub confirmed_at: Option<u64>,
    /// True if the timeout path confirmed this record.
    pub auto_confirmed: bool,
    pub direction: Direction,
}

impl TransferRequest {
    /// A new pending record.
    pub fn new(
        id: impl Into<String>,
        sender_device_id: impl Into<String>,
        receiver_device_id: impl Into<String>,
        receiver_type: impl Into<String>,
        direction: Direction,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender_device_id: sender_device_id.into(),
            receiver_device_id: receiver_device_id.into(),
            receiver_type: receiver_type.into(),
            status: TransferStatus::Pending,
            created_at,
            confirmed_at: None,
            auto_confirmed: false,
            direction,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransferStatus::Pending
    }

    /// Age in milliseconds at `now_ms`. Zero if the record is from the future.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }

    /// The peer on the other end of this handshake.
    pub fn counterpart(&self) -> &str {
        match self.direction {
            Direction::Outgoing => &self.receiver_device_id,
            Direction::Incoming => &self.sender_device_id,
        }
    }
}

/// Generates a transfer id that fits the payload id field unchanged.
pub fn new_transfer_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(TRANSFER_ID_LEN);
    id
}

// ---------------------------------------------------------------------------
// ThankYouMessage
// ---------------------------------------------------------------------------

/// Gratitude shown to the side that gave up the seat. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThankYouMessage {
    pub id: String,
    pub transfer_id: String,
    /// Device that should display the message (the original sender).
    pub recipient: String,
    pub text: String,
    pub created_at: u64,
}

impl ThankYouMessage {
    pub fn for_transfer(request: &TransferRequest, created_at: u64) -> Self {
        let text = if request.auto_confirmed {
            format!(
                "Thank you! Your seat went to someone who needed it ({}).",
                request.receiver_type
            )
        } else {
            format!(
                "Thank you for offering your seat ({}).",
                request.receiver_type
            )
        };
        Self {
            id: Uuid::new_v4().to_string(),
            transfer_id: request.id.clone(),
            recipient: request.sender_device_id.clone(),
            text,
            created_at,
        }
    }
}
