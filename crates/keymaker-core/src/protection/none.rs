use crate::crypto;
use crate::error::ProtectorError;
use crate::main_key::MainKey;

use super::{main_key_from_clear, Protector, ProtectorKind};

const NONE_AAD: &[u8] = b"keymaker.protector.none.v1";

// Compiled-in wrapping key. It keeps the main key out of the store in clear
// form; it is not a user secret.
const NONE_SECRET: [u8; 32] = [
    0x4b, 0x65, 0x79, 0x6d, 0x61, 0x6b, 0x65, 0x72, 0x2e, 0x4e, 0x6f, 0x6e, 0x65, 0x50, 0x72, 0x6f,
    0x74, 0x65, 0x63, 0x74, 0x69, 0x6f, 0x6e, 0x2e, 0x76, 0x31, 0x9e, 0x37, 0x79, 0xb9, 0x7f, 0x4a,
];

/// Fallback protector: unlocks without user interaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneProtection;

impl NoneProtection {
    pub fn new() -> Self {
        Self
    }
}

impl Protector for NoneProtection {
    fn kind(&self) -> ProtectorKind {
        ProtectorKind::None
    }

    fn lock(&self, main_key: &MainKey) -> Result<Vec<u8>, ProtectorError> {
        crypto::seal(&NONE_SECRET, main_key.as_bytes(), NONE_AAD)
            .map_err(|e| ProtectorError::LockFailed(e.to_string()))
    }

    fn unlock(&self, cyphertext: &[u8]) -> Result<MainKey, ProtectorError> {
        let clear = crypto::open(&NONE_SECRET, cyphertext, NONE_AAD)
            .map_err(|e| ProtectorError::UnlockFailed(e.to_string()))?;
        main_key_from_clear(&clear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_secret() {
        let key = MainKey::generate();
        let sealed = NoneProtection.lock(&key).unwrap();
        assert!(!sealed.windows(32).any(|w| w == key.as_bytes()));
        assert_eq!(NoneProtection.unlock(&sealed).unwrap(), key);
    }

    #[test]
    fn corrupt_cyphertext_fails() {
        let mut sealed = NoneProtection.lock(&MainKey::generate()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            NoneProtection.unlock(&sealed),
            Err(ProtectorError::UnlockFailed(_))
        ));
    }
}
