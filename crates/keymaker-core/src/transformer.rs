//! Key-bound value transformers for attribute-level encryption in a
//! persistence layer. The controller rebinds every registered transformer
//! when the main key is loaded and unbinds them when it is dropped, so a
//! transformer never seals or opens with a stale key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::locked::{Locked, LockedError};
use crate::main_key::MainKey;

pub const STRING_CRYPTO_TRANSFORMER: &str = "StringCryptoTransformer";

#[derive(Debug, Error)]
pub enum TransformerError {
    #[error("no main key bound to the transformer")]
    Unbound,

    #[error(transparent)]
    Locked(#[from] LockedError),
}

pub trait KeyBoundTransformer: Send + Sync {
    fn rebind(&self, key: Option<&MainKey>);

    fn is_bound(&self) -> bool;
}

/// Seals `String` attributes as `Locked<String>` ciphertext.
#[derive(Default)]
pub struct StringCryptoTransformer {
    key: RwLock<Option<MainKey>>,
}

impl StringCryptoTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&self, value: &str) -> Result<Vec<u8>, TransformerError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(TransformerError::Unbound)?;
        let locked = Locked::<String>::seal(&value.to_string(), key.as_bytes())?;
        Ok(locked.into_encrypted())
    }

    pub fn reverse_transform(&self, data: &[u8]) -> Result<String, TransformerError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(TransformerError::Unbound)?;
        Ok(Locked::<String>::from_encrypted(data.to_vec()).open(key.as_bytes())?)
    }
}

impl KeyBoundTransformer for StringCryptoTransformer {
    fn rebind(&self, key: Option<&MainKey>) {
        *self.key.write() = key.cloned();
    }

    fn is_bound(&self) -> bool {
        self.key.read().is_some()
    }
}

/// Named transformers, owned by one controller.
#[derive(Default)]
pub struct TransformerRegistry {
    transformers: RwLock<HashMap<String, Arc<dyn KeyBoundTransformer>>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the string transformer under its usual name.
    pub fn with_string_transformer() -> (Self, Arc<StringCryptoTransformer>) {
        let registry = Self::new();
        let transformer = Arc::new(StringCryptoTransformer::new());
        registry.register(STRING_CRYPTO_TRANSFORMER, transformer.clone());
        (registry, transformer)
    }

    pub fn register(&self, name: impl Into<String>, transformer: Arc<dyn KeyBoundTransformer>) {
        self.transformers.write().insert(name.into(), transformer);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn KeyBoundTransformer>> {
        self.transformers.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyBoundTransformer>> {
        self.transformers.read().get(name).cloned()
    }

    pub fn rebind_all(&self, key: Option<&MainKey>) {
        for transformer in self.transformers.read().values() {
            transformer.rebind(key);
        }
    }
}
