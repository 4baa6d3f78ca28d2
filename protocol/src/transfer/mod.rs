//! # Transfer State Machine
//!
//! The lifecycle of every seat handoff a device takes part in.
//!
//! ```text
//! request.rs  — TransferRequest, TransferStatus, Direction, ThankYouMessage
//! machine.rs  — TransferBook: the active set and its legal transitions
//! manager.rs  — TransferManager: locking, ledger settlement, subscribers
//! ```
//!
//! Both sides of a handshake keep their own copy of the record under the
//! same id. The giver's copy is [`Direction::Outgoing`], the seeker's is
//! [`Direction::Incoming`]. Only the seeker's copy can be accepted by the
//! confirmation timeout; the giver's copy is settled by the seeker's answer.

pub mod machine;
pub mod manager;
pub mod request;

pub use machine::{TransferBook, TransferError};
pub use manager::{Answer, TransferManager};
pub use request::{
    new_transfer_id, Direction, ThankYouMessage, TransferRequest, TransferStatus,
};
