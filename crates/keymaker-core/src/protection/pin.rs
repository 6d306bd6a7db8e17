use zeroize::Zeroizing;

use crate::crypto::{self, KdfParams, SALT_LEN};
use crate::error::ProtectorError;
use crate::main_key::MainKey;

use super::{main_key_from_clear, Protector, ProtectorKind};

const PIN_AAD: &[u8] = b"keymaker.protector.pin.v1";

/// Seals the main key under an Argon2id-stretched PIN.
///
/// Cyphertext layout: `[ salt (16) | nonce (24) | ciphertext + tag ]`. A fresh
/// salt is drawn on every lock, so the blob carries everything but the PIN.
pub struct PinProtection {
    pin: Zeroizing<String>,
    params: KdfParams,
}

impl PinProtection {
    pub fn new(pin: impl Into<String>) -> Self {
        Self::with_params(pin, KdfParams::default())
    }

    pub fn with_params(pin: impl Into<String>, params: KdfParams) -> Self {
        Self {
            pin: Zeroizing::new(pin.into()),
            params,
        }
    }
}

impl std::fmt::Debug for PinProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinProtection")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Protector for PinProtection {
    fn kind(&self) -> ProtectorKind {
        ProtectorKind::Pin
    }

    fn lock(&self, main_key: &MainKey) -> Result<Vec<u8>, ProtectorError> {
        if self.pin.is_empty() {
            return Err(ProtectorError::LockFailed("empty PIN".into()));
        }
        let salt = crypto::generate_salt();
        let wrapping = crypto::derive_key(self.pin.as_bytes(), &salt, &self.params)
            .map_err(|e| ProtectorError::LockFailed(e.to_string()))?;
        let sealed = crypto::seal(&wrapping[..], main_key.as_bytes(), PIN_AAD)
            .map_err(|e| ProtectorError::LockFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unlock(&self, cyphertext: &[u8]) -> Result<MainKey, ProtectorError> {
        if cyphertext.len() < SALT_LEN {
            return Err(ProtectorError::UnlockFailed("PIN cyphertext truncated".into()));
        }
        let (salt, sealed) = cyphertext.split_at(SALT_LEN);
        let wrapping = crypto::derive_key(self.pin.as_bytes(), salt, &self.params)
            .map_err(|e| ProtectorError::UnlockFailed(e.to_string()))?;
        let clear = crypto::open(&wrapping[..], sealed, PIN_AAD)
            .map_err(|_| ProtectorError::UnlockFailed("wrong PIN or corrupt cyphertext".into()))?;
        main_key_from_clear(&clear)
    }
}
