//! # SeatDb — Persistent Storage
//!
//! Thin wrapper over sled. Each logical store is its own named tree:
//!
//! | Tree       | Key            | Value                         |
//! |------------|----------------|-------------------------------|
//! | `points`   | key (UTF-8)    | `u64` (8B BE)                 |
//! | `settings` | key (UTF-8)    | JSON                          |
//!
//! Writes are not flushed per call. The ledger treats persistence as
//! fire-and-forget: sled flushes in the background, and [`SeatDb::flush`]
//! is there for clean shutdown.

use std::path::Path;

use sled::{Db, Tree};

use super::kv::StoreError;
use crate::config::{POINTS_STORE, SETTINGS_STORE};

pub type DbResult<T> = Result<T, StoreError>;

/// Persistent storage for one device.
///
/// Cloning is cheap; all clones share the same sled handle.
#[derive(Debug, Clone)]
pub struct SeatDb {
    db: Db,
    points: Tree,
    settings: Tree,
}

impl SeatDb {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop. For tests and throwaway
    /// simulated devices.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let points = db.open_tree(POINTS_STORE)?;
        let settings = db.open_tree(SETTINGS_STORE)?;
        Ok(Self {
            db,
            points,
            settings,
        })
    }

    /// The ledger store.
    pub fn points(&self) -> Tree {
        self.points.clone()
    }

    /// The preferences store.
    pub fn settings(&self) -> Tree {
        self.settings.clone()
    }

    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
