//! # Storage Module
//!
//! Persistence for one device: the points ledger and user preferences.
//!
//! ```text
//! kv.rs        — KeyValueStore trait, JSON helpers, sled::Tree impl, MemoryStore
//! db.rs        — SeatDb: sled database with the `points` and `settings` trees
//! settings.rs  — typed preferences as JSON values
//! ```
//!
//! The two stores are independent. Nothing in the protocol reads one from
//! the other, and either can be swapped for a [`MemoryStore`].

pub mod db;
pub mod kv;
pub mod settings;

pub use db::SeatDb;
pub use kv::{get_json, put_json, KeyValueStore, MemoryStore, SharedStore, StoreError};
pub use settings::{Settings, SettingsStore};
