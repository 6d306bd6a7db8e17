//! Protectors decide how the main key is locked at rest.
//!
//! Each variant owns one cyphertext slot in the [`SecretStore`], named after
//! the variant. Several variants may be active at once; the main key is then
//! sealed once per active variant and any of them can unseal it.

mod bio;
mod none;
mod pin;
mod random_pin;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtectorError, StoreError};
use crate::main_key::MainKey;
use crate::store::{EntryPolicy, SecretStore};

pub use bio::{BioProtection, UserPresence, BIO_ENCLAVE_SLOT};
pub use none::NoneProtection;
pub use pin::PinProtection;
pub use random_pin::{RandomPinProtection, RANDOM_PIN_SECRET_SLOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectorKind {
    None,
    Pin,
    Biometric,
    /// App key: a generated secret the host unlocks with in the background.
    RandomPin,
}

impl ProtectorKind {
    pub const ALL: [ProtectorKind; 4] = [
        ProtectorKind::None,
        ProtectorKind::Pin,
        ProtectorKind::Biometric,
        ProtectorKind::RandomPin,
    ];

    pub fn slot(self) -> &'static str {
        match self {
            ProtectorKind::None => "NoneProtection",
            ProtectorKind::Pin => "PinProtection",
            ProtectorKind::Biometric => "BioProtection",
            ProtectorKind::RandomPin => "RandomPinProtection",
        }
    }

    /// Significant protectors need a user-supplied secret to unlock.
    pub fn is_significant(self) -> bool {
        !matches!(self, ProtectorKind::None)
    }

    /// Failed unlocks count toward the wipe limit only for secrets a person
    /// can guess. A cancelled biometric prompt is not a guess.
    pub fn counts_failed_unlocks(self) -> bool {
        matches!(self, ProtectorKind::Pin)
    }

    pub fn cyphertext(self, store: &dyn SecretStore) -> Result<Option<Vec<u8>>, StoreError> {
        store.get(self.slot())
    }

    pub fn is_active(self, store: &dyn SecretStore) -> Result<bool, StoreError> {
        Ok(self.cyphertext(store)?.is_some())
    }

    pub fn remove_cyphertext(self, store: &dyn SecretStore) -> Result<(), StoreError> {
        store.remove(self.slot())
    }
}

impl fmt::Display for ProtectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtectorKind::None => "none",
            ProtectorKind::Pin => "pin",
            ProtectorKind::Biometric => "biometric",
            ProtectorKind::RandomPin => "random-pin",
        };
        f.write_str(name)
    }
}

pub trait Protector: Send + Sync {
    fn kind(&self) -> ProtectorKind;

    /// Seal the main key under this variant's secret.
    fn lock(&self, main_key: &MainKey) -> Result<Vec<u8>, ProtectorError>;

    fn unlock(&self, cyphertext: &[u8]) -> Result<MainKey, ProtectorError>;

    /// Removes any auxiliary material the variant keeps beside its slot.
    fn remove_auxiliary(&self, _store: &dyn SecretStore) -> Result<(), StoreError> {
        Ok(())
    }

    fn persist_policy(&self) -> EntryPolicy {
        EntryPolicy::default()
    }

    fn cyphertext(&self, store: &dyn SecretStore) -> Result<Option<Vec<u8>>, StoreError> {
        self.kind().cyphertext(store)
    }

    fn persist(&self, store: &dyn SecretStore, cyphertext: &[u8]) -> Result<(), StoreError> {
        store.set_with_policy(self.kind().slot(), cyphertext, self.persist_policy())
    }

    fn remove_persisted_cyphertext(&self, store: &dyn SecretStore) -> Result<(), StoreError> {
        self.kind().remove_cyphertext(store)?;
        self.remove_auxiliary(store)
    }

    fn is_significant(&self) -> bool {
        self.kind().is_significant()
    }
}

pub(crate) fn main_key_from_clear(clear: &[u8]) -> Result<MainKey, ProtectorError> {
    MainKey::from_slice(clear).map_err(|e| ProtectorError::UnlockFailed(e.to_string()))
}
