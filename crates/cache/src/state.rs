//! Hand-off slots between the restore and save phases of one job

use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Slot holding the primary key the restore phase looked up
pub const STATE_PRIMARY_KEY: &str = "CACHE_PRIMARY_KEY";

/// Slot holding the key the restore phase restored, empty on a miss
pub const STATE_RESTORED_KEY: &str = "CACHE_RESTORED_KEY";

/// Durable per-job key-value storage
pub trait StateStore: Send + Sync {
    /// Value written by an earlier phase, if any
    fn get(&self, name: &str) -> Option<String>;

    /// Record a value for a later phase
    fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// In-process state, for tests and single-process runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, name: &str) -> Option<String> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }
}

/// Discards writes; used when no save phase follows
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateStore;

impl StateStore for NullStateStore {
    fn get(&self, _name: &str) -> Option<String> {
        None
    }

    fn set(&self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get(STATE_PRIMARY_KEY), None);
        store.set(STATE_PRIMARY_KEY, "linux-v1").unwrap();
        assert_eq!(store.get(STATE_PRIMARY_KEY).as_deref(), Some("linux-v1"));
        store.set(STATE_PRIMARY_KEY, "linux-v2").unwrap();
        assert_eq!(store.get(STATE_PRIMARY_KEY).as_deref(), Some("linux-v2"));
    }

    #[test]
    fn test_null_store_forgets() {
        let store = NullStateStore;
        store.set(STATE_RESTORED_KEY, "linux-v1").unwrap();
        assert_eq!(store.get(STATE_RESTORED_KEY), None);
    }
}
