use std::sync::Arc;

use tracing::debug;

use crate::crypto::{self, KEY_LEN};
use crate::error::{ProtectorError, StoreError};
use crate::main_key::MainKey;
use crate::store::{EntryPolicy, SecretStore};

use super::{main_key_from_clear, Protector, ProtectorKind};

const BIO_AAD: &[u8] = b"keymaker.protector.bio.v1";

/// Slot holding the device-bound wrapping secret released after a presence check.
pub const BIO_ENCLAVE_SLOT: &str = "BioProtection.enclave";

/// Platform hook that performs the biometric / device-passcode check.
pub trait UserPresence: Send + Sync {
    /// Whether the device can currently perform a presence check at all.
    fn is_available(&self) -> bool;

    /// Blocks until the user passes or fails the check. `Err` carries the
    /// platform's reason (cancelled, lockout, mismatch).
    fn authenticate(&self, reason: &str) -> Result<(), String>;
}

/// Seals the main key under a random secret stored with
/// [`crate::store::AccessControl::UserPresence`].
pub struct BioProtection {
    store: Arc<dyn SecretStore>,
    presence: Arc<dyn UserPresence>,
    reason: String,
}

impl BioProtection {
    pub fn new(store: Arc<dyn SecretStore>, presence: Arc<dyn UserPresence>) -> Self {
        Self {
            store,
            presence,
            reason: "Unlock the app".to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    fn enclave_secret(&self, create: bool) -> Result<Option<zeroize::Zeroizing<Vec<u8>>>, StoreError> {
        if let Some(existing) = self.store.get(BIO_ENCLAVE_SLOT)? {
            return Ok(Some(zeroize::Zeroizing::new(existing)));
        }
        if !create {
            return Ok(None);
        }
        debug!("creating biometric wrapping secret");
        let fresh = zeroize::Zeroizing::new(crypto::random_bytes::<KEY_LEN>().to_vec());
        self.store
            .set_with_policy(BIO_ENCLAVE_SLOT, &fresh, EntryPolicy::user_presence())?;
        Ok(Some(fresh))
    }
}

impl Protector for BioProtection {
    fn kind(&self) -> ProtectorKind {
        ProtectorKind::Biometric
    }

    fn lock(&self, main_key: &MainKey) -> Result<Vec<u8>, ProtectorError> {
        if !self.presence.is_available() {
            return Err(ProtectorError::LockFailed(
                "biometric authentication unavailable".into(),
            ));
        }
        let secret = self
            .enclave_secret(true)?
            .ok_or_else(|| ProtectorError::LockFailed("wrapping secret missing".into()))?;
        crypto::seal(&secret, main_key.as_bytes(), BIO_AAD)
            .map_err(|e| ProtectorError::LockFailed(e.to_string()))
    }

    fn unlock(&self, cyphertext: &[u8]) -> Result<MainKey, ProtectorError> {
        self.presence
            .authenticate(&self.reason)
            .map_err(ProtectorError::UnlockFailed)?;
        let secret = self
            .enclave_secret(false)?
            .ok_or_else(|| ProtectorError::UnlockFailed("wrapping secret missing".into()))?;
        let clear = crypto::open(&secret, cyphertext, BIO_AAD)
            .map_err(|e| ProtectorError::UnlockFailed(e.to_string()))?;
        main_key_from_clear(&clear)
    }

    fn remove_auxiliary(&self, store: &dyn SecretStore) -> Result<(), StoreError> {
        store.remove(BIO_ENCLAVE_SLOT)
    }
}
