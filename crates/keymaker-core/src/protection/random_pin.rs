use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN};
use crate::error::{ProtectorError, StoreError};
use crate::main_key::MainKey;
use crate::store::SecretStore;

use super::{main_key_from_clear, Protector, ProtectorKind};

const RANDOM_PIN_AAD: &[u8] = b"keymaker.protector.random-pin.v1";

/// Slot holding the generated app-key secret.
pub const RANDOM_PIN_SECRET_SLOT: &str = "RandomPinProtection.secret";

/// App-key protector: seals the main key under a generated 32-byte secret
/// kept in its own slot. Background work (extensions, push handling) can
/// unlock with it without prompting the user.
pub struct RandomPinProtection {
    secret: Zeroizing<[u8; KEY_LEN]>,
}

impl RandomPinProtection {
    /// Draws a new secret and stores it.
    pub fn generate(store: &dyn SecretStore) -> Result<Self, StoreError> {
        let secret = Zeroizing::new(crypto::random_bytes::<KEY_LEN>());
        store.set(RANDOM_PIN_SECRET_SLOT, &secret[..])?;
        Ok(Self { secret })
    }

    /// Secret previously stored by [`RandomPinProtection::generate`], if any.
    pub fn load(store: &dyn SecretStore) -> Result<Option<Self>, StoreError> {
        let Some(raw) = store.get(RANDOM_PIN_SECRET_SLOT)? else {
            return Ok(None);
        };
        let raw = Zeroizing::new(raw);
        let secret: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| StoreError::Read {
            key: RANDOM_PIN_SECRET_SLOT.to_string(),
            reason: format!("expected {KEY_LEN} bytes, got {}", raw.len()),
        })?;
        Ok(Some(Self {
            secret: Zeroizing::new(secret),
        }))
    }
}

impl std::fmt::Debug for RandomPinProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RandomPinProtection(<redacted>)")
    }
}

impl Protector for RandomPinProtection {
    fn kind(&self) -> ProtectorKind {
        ProtectorKind::RandomPin
    }

    fn lock(&self, main_key: &MainKey) -> Result<Vec<u8>, ProtectorError> {
        crypto::seal(&self.secret[..], main_key.as_bytes(), RANDOM_PIN_AAD)
            .map_err(|e| ProtectorError::LockFailed(e.to_string()))
    }

    fn unlock(&self, cyphertext: &[u8]) -> Result<MainKey, ProtectorError> {
        let clear = crypto::open(&self.secret[..], cyphertext, RANDOM_PIN_AAD)
            .map_err(|e| ProtectorError::UnlockFailed(e.to_string()))?;
        main_key_from_clear(&clear)
    }

    fn remove_auxiliary(&self, store: &dyn SecretStore) -> Result<(), StoreError> {
        store.remove(RANDOM_PIN_SECRET_SLOT)
    }
}
