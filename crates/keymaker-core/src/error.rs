use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch or wrong key)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret store read failed for {key}: {reason}")]
    Read { key: String, reason: String },

    #[error("secret store write failed for {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("secret store delete failed for {key}: {reason}")]
    Delete { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProtectorError {
    #[error("protector could not seal the main key: {0}")]
    LockFailed(String),

    #[error("protector could not unseal the main key: {0}")]
    UnlockFailed(String),

    #[error("no cyphertext persisted for this protector")]
    NoCyphertext,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum KeymakerError {
    #[error("no main key available without user interaction")]
    NoKeyAvailable,

    #[error("main key controller is shut down")]
    ControllerGone,

    #[error("could not start control thread: {0}")]
    Worker(String),

    #[error(transparent)]
    Protector(#[from] ProtectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
