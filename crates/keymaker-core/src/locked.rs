//! `Locked<T>`: a value that exists only as ciphertext.
//!
//! Two key-based encodings exist:
//! - the item encoding, shared by `String`, `Vec<u8>`, `Vec<String>` and
//!   `Vec<Vec<u8>>` (single values are sealed as one-item sequences), and
//! - the structured encoding for any serde value.
//!
//! Both go through XChaCha20-Poly1305 with a fresh random nonce per seal.
//! Callers with their own cipher use [`Locked::seal_with`] / [`Locked::open_with`].

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::crypto;
use crate::error::CryptoError;

const ITEMS_AAD: &[u8] = b"keymaker.locked.items.v1";
const STRUCTURED_AAD: &[u8] = b"keymaker.locked.structured.v1";

#[derive(Debug, Error)]
pub enum LockedError {
    #[error("failed to encode clear value: {0}")]
    FailedToEncode(String),

    #[error("key does not fit the cipher: {0}")]
    KeyMismatch(String),

    #[error("failed to encrypt clear value")]
    FailedToEncrypt,

    #[error("failed to decrypt value (wrong key or corrupt ciphertext)")]
    FailedToDecrypt,

    #[error("decrypted payload did not parse: {0}")]
    FailedToDecode(String),
}

impl From<CryptoError> for LockedError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey(reason) => LockedError::KeyMismatch(reason),
            CryptoError::AeadEncrypt => LockedError::FailedToEncrypt,
            CryptoError::KeyDerivation(reason) => LockedError::KeyMismatch(reason),
            CryptoError::AeadDecrypt => LockedError::FailedToDecrypt,
        }
    }
}

pub struct Locked<T> {
    encrypted_value: Vec<u8>,
    _clear: PhantomData<fn() -> T>,
}

impl<T> Locked<T> {
    /// Wraps ciphertext previously produced by one of the seal functions.
    pub fn from_encrypted(encrypted_value: Vec<u8>) -> Self {
        Self {
            encrypted_value,
            _clear: PhantomData,
        }
    }

    pub fn encrypted_value(&self) -> &[u8] {
        &self.encrypted_value
    }

    pub fn into_encrypted(self) -> Vec<u8> {
        self.encrypted_value
    }

    pub fn seal_with<F>(clear_value: T, encryptor: F) -> Result<Self, LockedError>
    where
        F: FnOnce(T) -> Result<Vec<u8>, LockedError>,
    {
        Ok(Self::from_encrypted(encryptor(clear_value)?))
    }

    pub fn open_with<F>(&self, decryptor: F) -> Result<T, LockedError>
    where
        F: FnOnce(&[u8]) -> Result<T, LockedError>,
    {
        decryptor(&self.encrypted_value)
    }
}

impl<T: Sealable> Locked<T> {
    pub fn seal(clear_value: &T, key: &[u8]) -> Result<Self, LockedError> {
        let encoded = encode_items(&clear_value.items())?;
        let sealed = crypto::seal(key, &encoded, ITEMS_AAD)?;
        Ok(Self::from_encrypted(sealed))
    }

    pub fn open(&self, key: &[u8]) -> Result<T, LockedError> {
        let clear = crypto::open(key, &self.encrypted_value, ITEMS_AAD)?;
        T::from_items(decode_items(&clear)?)
    }
}

impl<T: Serialize + DeserializeOwned> Locked<T> {
    pub fn seal_structured(clear_value: &T, key: &[u8]) -> Result<Self, LockedError> {
        let encoded = zeroize::Zeroizing::new(
            serde_json::to_vec(clear_value)
                .map_err(|e| LockedError::FailedToEncode(e.to_string()))?,
        );
        let sealed = crypto::seal(key, &encoded, STRUCTURED_AAD)?;
        Ok(Self::from_encrypted(sealed))
    }

    pub fn open_structured(&self, key: &[u8]) -> Result<T, LockedError> {
        let clear = crypto::open(key, &self.encrypted_value, STRUCTURED_AAD)?;
        serde_json::from_slice(&clear).map_err(|e| LockedError::FailedToDecode(e.to_string()))
    }
}

impl<T> Clone for Locked<T> {
    fn clone(&self) -> Self {
        Self::from_encrypted(self.encrypted_value.clone())
    }
}

impl<T> PartialEq for Locked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.encrypted_value == other.encrypted_value
    }
}

impl<T> Eq for Locked<T> {}

impl<T> fmt::Debug for Locked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked")
            .field("type", &std::any::type_name::<T>())
            .field("len", &self.encrypted_value.len())
            .finish()
    }
}

/// Values sealed through the item encoding.
pub trait Sealable: Sized {
    fn items(&self) -> Vec<&[u8]>;
    fn from_items(items: Vec<Vec<u8>>) -> Result<Self, LockedError>;
}

impl Sealable for Vec<Vec<u8>> {
    fn items(&self) -> Vec<&[u8]> {
        self.iter().map(Vec::as_slice).collect()
    }

    fn from_items(items: Vec<Vec<u8>>) -> Result<Self, LockedError> {
        Ok(items)
    }
}

impl Sealable for Vec<String> {
    fn items(&self) -> Vec<&[u8]> {
        self.iter().map(String::as_bytes).collect()
    }

    fn from_items(items: Vec<Vec<u8>>) -> Result<Self, LockedError> {
        items
            .into_iter()
            .map(|item| {
                String::from_utf8(item).map_err(|e| LockedError::FailedToDecode(e.to_string()))
            })
            .collect()
    }
}

impl Sealable for Vec<u8> {
    fn items(&self) -> Vec<&[u8]> {
        vec![self.as_slice()]
    }

    fn from_items(items: Vec<Vec<u8>>) -> Result<Self, LockedError> {
        single(items)
    }
}

impl Sealable for String {
    fn items(&self) -> Vec<&[u8]> {
        vec![self.as_bytes()]
    }

    fn from_items(items: Vec<Vec<u8>>) -> Result<Self, LockedError> {
        String::from_utf8(single(items)?).map_err(|e| LockedError::FailedToDecode(e.to_string()))
    }
}

fn single(items: Vec<Vec<u8>>) -> Result<Vec<u8>, LockedError> {
    let count = items.len();
    let mut items = items.into_iter();
    match (items.next(), items.next()) {
        (Some(item), None) => Ok(item),
        _ => Err(LockedError::FailedToDecode(format!(
            "expected exactly one item, found {count}"
        ))),
    }
}

/// Format: `[count: u32 LE] ([len: u32 LE] [bytes])*`
fn encode_items(items: &[&[u8]]) -> Result<zeroize::Zeroizing<Vec<u8>>, LockedError> {
    let frame_len = |n: usize| {
        u32::try_from(n).map_err(|_| LockedError::FailedToEncode(format!("{n} exceeds u32 framing")))
    };
    let total = 4 + items.iter().map(|i| 4 + i.len()).sum::<usize>();
    let mut out = zeroize::Zeroizing::new(Vec::with_capacity(total));
    out.extend_from_slice(&frame_len(items.len())?.to_le_bytes());
    for item in items {
        out.extend_from_slice(&frame_len(item.len())?.to_le_bytes());
        out.extend_from_slice(item);
    }
    Ok(out)
}

fn read_u32(buf: &mut &[u8]) -> Result<usize, LockedError> {
    if buf.len() < 4 {
        return Err(LockedError::FailedToDecode("truncated frame header".into()));
    }
    let current: &[u8] = *buf;
    let (head, rest) = current.split_at(4);
    *buf = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize)
}

fn decode_items(mut buf: &[u8]) -> Result<Vec<Vec<u8>>, LockedError> {
    let count = read_u32(&mut buf)?;
    let mut items = Vec::with_capacity(count.min(buf.len() / 4));
    for _ in 0..count {
        let len = read_u32(&mut buf)?;
        if len > buf.len() {
            return Err(LockedError::FailedToDecode(format!(
                "item length {len} exceeds remaining {}",
                buf.len()
            )));
        }
        let (item, rest) = buf.split_at(len);
        items.push(item.to_vec());
        buf = rest;
    }
    if !buf.is_empty() {
        return Err(LockedError::FailedToDecode("trailing bytes after items".into()));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_key::MainKey;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Credential {
        user_id: String,
        refresh_token: String,
        scopes: Vec<String>,
    }

    fn flip_first_bit(key: &MainKey) -> MainKey {
        let mut bytes = *key.as_bytes();
        bytes[0] ^= 0x01;
        MainKey::from(bytes)
    }

    #[test]
    fn string_opens_with_same_key() {
        let key = MainKey::generate();
        let locked = Locked::<String>::seal(&"mobile signature".to_string(), key.as_bytes()).unwrap();
        assert_ne!(locked.encrypted_value(), b"mobile signature");
        assert_eq!(locked.open(key.as_bytes()).unwrap(), "mobile signature");
    }

    #[test]
    fn string_and_single_item_array_share_encoding() {
        let key = MainKey::generate();
        let locked = Locked::<String>::seal(&"token".to_string(), key.as_bytes()).unwrap();
        let as_array = Locked::<Vec<String>>::from_encrypted(locked.into_encrypted());
        assert_eq!(as_array.open(key.as_bytes()).unwrap(), vec!["token".to_string()]);
    }

    #[test]
    fn multi_item_array_cannot_open_as_single_value() {
        let key = MainKey::generate();
        let items = vec!["a".to_string(), "b".to_string()];
        let locked = Locked::<Vec<String>>::seal(&items, key.as_bytes()).unwrap();
        let as_string = Locked::<String>::from_encrypted(locked.encrypted_value().to_vec());
        assert!(matches!(
            as_string.open(key.as_bytes()),
            Err(LockedError::FailedToDecode(_))
        ));
        assert_eq!(locked.open(key.as_bytes()).unwrap(), items);
    }

    #[test]
    fn data_and_empty_data() {
        let key = MainKey::generate();
        for value in [vec![], vec![0u8, 1, 2, 255]] {
            let locked = Locked::<Vec<u8>>::seal(&value, key.as_bytes()).unwrap();
            assert_eq!(locked.open(key.as_bytes()).unwrap(), value);
        }
        let blobs = vec![vec![9u8; 3], vec![], vec![1u8]];
        let locked = Locked::<Vec<Vec<u8>>>::seal(&blobs, key.as_bytes()).unwrap();
        assert_eq!(locked.open(key.as_bytes()).unwrap(), blobs);
    }

    #[test]
    fn other_key_fails_closed() {
        let key = MainKey::generate();
        let locked = Locked::<String>::seal(&"secret".to_string(), key.as_bytes()).unwrap();
        let err = locked.open(MainKey::generate().as_bytes()).unwrap_err();
        assert!(matches!(err, LockedError::FailedToDecrypt));
    }

    #[test]
    fn wrong_key_length_is_key_mismatch() {
        let err = Locked::<String>::seal(&"x".to_string(), &[0u8; 16]).unwrap_err();
        assert!(matches!(err, LockedError::KeyMismatch(_)));
    }

    #[test]
    fn structured_value_roundtrip_and_bit_flip() {
        let key = MainKey::generate();
        let value = serde_json::json!({"a": 1});
        let locked = Locked::<serde_json::Value>::seal_structured(&value, key.as_bytes()).unwrap();
        let plain = serde_json::to_vec(&value).unwrap();
        assert!(!locked
            .encrypted_value()
            .windows(plain.len())
            .any(|w| w == plain.as_slice()));
        assert_eq!(locked.open_structured(key.as_bytes()).unwrap(), value);

        let flipped = flip_first_bit(&key);
        assert!(matches!(
            locked.open_structured(flipped.as_bytes()),
            Err(LockedError::FailedToDecrypt)
        ));
    }

    #[test]
    fn structured_record_roundtrip() {
        let key = MainKey::generate();
        let records = vec![Credential {
            user_id: "u-1".into(),
            refresh_token: "r-abc".into(),
            scopes: vec!["mail".into(), "full".into()],
        }];
        let locked = Locked::<Vec<Credential>>::seal_structured(&records, key.as_bytes()).unwrap();
        assert_eq!(locked.open_structured(key.as_bytes()).unwrap(), records);
    }

    #[test]
    fn encodings_are_not_interchangeable() {
        let key = MainKey::generate();
        let items = Locked::<String>::seal(&"\"quoted\"".to_string(), key.as_bytes()).unwrap();
        assert!(matches!(
            items.open_structured(key.as_bytes()),
            Err(LockedError::FailedToDecrypt)
        ));
    }

    #[test]
    fn closure_pair_roundtrip() {
        let locked = Locked::seal_with(41u32, |v| Ok((v + 1).to_be_bytes().to_vec())).unwrap();
        let opened = locked
            .open_with(|bytes| {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| LockedError::FailedToDecrypt)?;
                Ok(u32::from_be_bytes(arr) - 1)
            })
            .unwrap();
        assert_eq!(opened, 41);
    }

    #[test]
    fn truncated_frames_rejected() {
        assert!(decode_items(&[2, 0, 0, 0, 1, 0, 0, 0]).is_err());
        assert!(decode_items(&[1, 0]).is_err());
        assert!(decode_items(&[0, 0, 0, 0, 7]).is_err());
    }
}
