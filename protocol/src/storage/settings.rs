//! User preferences, stored as JSON values in the `settings` store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::kv::{get_json, put_json, SharedStore, StoreError};
use crate::config::KEY_USER_MODE;
use crate::device::UserMode;

const KEY_AUTO_CONFIRM: &str = "auto_confirm";
const KEY_ENABLE_NOTIFICATIONS: &str = "enable_notifications";
const KEY_USER_TYPE: &str = "user_type";

/// Snapshot of every known preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Mode restored at startup.
    pub user_mode: UserMode,
    /// Whether unanswered incoming requests are accepted on timeout.
    pub auto_confirm: bool,
    /// Whether seeker-nearby alerts are raised.
    pub enable_notifications: bool,
    /// Reason sent with this user's requests when none is given.
    pub user_type: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_mode: UserMode::Available,
            auto_confirm: true,
            enable_notifications: true,
            user_type: "pregnant".to_string(),
        }
    }
}

/// Typed access to the settings store.
#[derive(Clone)]
pub struct SettingsStore {
    store: SharedStore,
}

impl SettingsStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        get_json(self.store.as_ref(), key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        put_json(self.store.as_ref(), key, value)
    }

    /// Reads every preference. Missing or unreadable values fall back to
    /// their defaults.
    pub fn load(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            user_mode: self.get_or(KEY_USER_MODE, defaults.user_mode),
            auto_confirm: self.get_or(KEY_AUTO_CONFIRM, defaults.auto_confirm),
            enable_notifications: self
                .get_or(KEY_ENABLE_NOTIFICATIONS, defaults.enable_notifications),
            user_type: self.get_or(KEY_USER_TYPE, defaults.user_type),
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), StoreError> {
        self.set(KEY_USER_MODE, &settings.user_mode)?;
        self.set(KEY_AUTO_CONFIRM, &settings.auto_confirm)?;
        self.set(KEY_ENABLE_NOTIFICATIONS, &settings.enable_notifications)?;
        self.set(KEY_USER_TYPE, &settings.user_type)
    }

    pub fn user_mode(&self) -> UserMode {
        self.get_or(KEY_USER_MODE, UserMode::Available)
    }

    pub fn set_user_mode(&self, mode: UserMode) -> Result<(), StoreError> {
        self.set(KEY_USER_MODE, &mode)
    }

    fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                warn!(key, error = %e, "unreadable setting, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::kv::{KeyValueStore, MemoryStore};

    #[test]
    fn empty_store_yields_defaults() {
        let settings = SettingsStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(settings.load(), Settings::default());
        assert_eq!(settings.user_mode(), UserMode::Available);
    }

    #[test]
    fn saved_settings_load_back() {
        let settings = SettingsStore::new(Arc::new(MemoryStore::new()));
        let custom = Settings {
            user_mode: UserMode::NeedSeat,
            auto_confirm: false,
            enable_notifications: false,
            user_type: "elderly".into(),
        };
        settings.save(&custom).unwrap();
        assert_eq!(settings.load(), custom);
    }

    #[test]
    fn corrupt_value_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        store.put_raw(KEY_USER_MODE, b"not json").unwrap();
        let settings = SettingsStore::new(store);
        assert_eq!(settings.user_mode(), UserMode::Available);
    }

    #[test]
    fn user_mode_roundtrip() {
        let settings = SettingsStore::new(Arc::new(MemoryStore::new()));
        settings.set_user_mode(UserMode::NeedSeat).unwrap();
        assert_eq!(settings.user_mode(), UserMode::NeedSeat);
    }
}
