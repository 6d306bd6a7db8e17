use std::collections::HashMap;

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accessibility {
    /// Readable once the device has been unlocked after boot; never migrates off the device.
    #[default]
    AfterFirstUnlockThisDeviceOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessControl {
    #[default]
    None,
    /// Release requires a biometric or device-passcode check.
    UserPresence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryPolicy {
    pub accessibility: Accessibility,
    pub access_control: AccessControl,
}

impl EntryPolicy {
    pub fn user_presence() -> Self {
        Self {
            accessibility: Accessibility::AfterFirstUnlockThisDeviceOnly,
            access_control: AccessControl::UserPresence,
        }
    }
}

/// Durable key-value store for protector cyphertext.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set_with_policy(&self, key: &str, value: &[u8], policy: EntryPolicy) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.set_with_policy(key, value, EntryPolicy::default())
    }

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn remove_all(&self) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct StoredEntry {
    value: Zeroizing<Vec<u8>>,
    policy: EntryPolicy,
}

/// Process-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn policy(&self, key: &str) -> Option<EntryPolicy> {
        self.entries.read().get(key).map(|entry| entry.policy)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .get(key)
            .map(|entry| entry.value.to_vec()))
    }

    fn set_with_policy(&self, key: &str, value: &[u8], policy: EntryPolicy) -> Result<(), StoreError> {
        self.entries.write().insert(
            key.to_string(),
            StoredEntry {
                value: Zeroizing::new(value.to_vec()),
                policy,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn remove_all(&self) -> Result<(), StoreError> {
        self.entries.write().clear();
        Ok(())
    }
}
