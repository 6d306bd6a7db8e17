//! Main-key custody for an encrypted client: a random 32-byte key sealed at
//! rest under one or more protectors, loaded on demand and dropped on lock.

pub mod autolock;
pub mod crypto;
pub mod error;
pub mod keymaker;
pub mod locked;
pub mod main_key;
pub mod paths;
pub mod protection;
pub mod secure_storage;
pub mod settings;
pub mod store;
pub mod transformer;

pub use autolock::{AutolockTimeout, Autolocker, Clock, CountdownAutolocker, ManualClock, SystemClock};
pub use error::{CryptoError, KeymakerError, ProtectorError, StoreError};
pub use keymaker::{Keymaker, KeymakerBuilder, KeymakerEvent, Subscription, FAILED_UNLOCKS_SLOT};
pub use locked::{Locked, LockedError, Sealable};
pub use main_key::MainKey;
pub use protection::{
    BioProtection, NoneProtection, PinProtection, Protector, ProtectorKind, RandomPinProtection,
    UserPresence, RANDOM_PIN_SECRET_SLOT,
};
pub use secure_storage::KeyringStore;
pub use settings::KeymakerSettings;
pub use store::{AccessControl, Accessibility, EntryPolicy, MemoryStore, SecretStore};
pub use transformer::{
    KeyBoundTransformer, StringCryptoTransformer, TransformerError, TransformerRegistry,
};
