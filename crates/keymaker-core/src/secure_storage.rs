//! OS credential store backend (Keychain, Credential Manager, Secret Service).

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::{EntryPolicy, SecretStore};

const INDEX_KEY: &str = "keymaker.index";

/// `SecretStore` over the platform keyring. Values are base64-encoded; an
/// index entry lists every key written so `remove_all` can find them.
pub struct KeyringStore {
    service: String,
    index_lock: Mutex<()>,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(|e| StoreError::Read {
            key: key.to_string(),
            reason: format!("keyring init: {e}"),
        })
    }

    fn read_index(&self) -> Result<Vec<String>, StoreError> {
        match self.entry(INDEX_KEY)?.get_password() {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Read {
                key: INDEX_KEY.to_string(),
                reason: format!("parse index: {e}"),
            }),
            Err(keyring::Error::NoEntry) => Ok(Vec::new()),
            Err(e) => Err(StoreError::Read {
                key: INDEX_KEY.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn write_index(&self, keys: &[String]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(keys).map_err(|e| StoreError::Write {
            key: INDEX_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.entry(INDEX_KEY)?
            .set_password(&raw)
            .map_err(|e| StoreError::Write {
                key: INDEX_KEY.to_string(),
                reason: e.to_string(),
            })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Delete {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let encoded = match self.entry(key)?.get_password() {
            Ok(encoded) => encoded,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => {
                return Err(StoreError::Read {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| StoreError::Read {
                key: key.to_string(),
                reason: format!("decode: {e}"),
            })
    }

    // Desktop keyrings have no per-entry presence gate; the policy is
    // enforced by the protector that owns the entry.
    fn set_with_policy(&self, key: &str, value: &[u8], _policy: EntryPolicy) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock();
        let encoded = general_purpose::STANDARD.encode(value);
        self.entry(key)?
            .set_password(&encoded)
            .map_err(|e| StoreError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        let mut index = self.read_index()?;
        if !index.iter().any(|k| k == key) {
            index.push(key.to_string());
            self.write_index(&index)?;
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock();
        self.delete(key)?;
        let mut index = self.read_index()?;
        let before = index.len();
        index.retain(|k| k != key);
        if index.len() != before {
            self.write_index(&index)?;
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock();
        for key in self.read_index()? {
            self.delete(&key)?;
        }
        self.delete(INDEX_KEY)
    }
}
