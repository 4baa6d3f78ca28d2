//! # Ledger Module
//!
//! Points earned by giving up a seat, and what they can be spent on.
//!
//! ```text
//! points.rs   — PointsLedger: balance + transfer counter, add/spend
//! rewards.rs  — fixed reward catalog
//! ```

pub mod points;
pub mod rewards;

pub use points::{LedgerError, PointsLedger, PointsSnapshot};
pub use rewards::{Reward, UnknownReward};
