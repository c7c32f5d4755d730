//! Per-entry content keys.
//!
//! A protected entry stores key material in its manifest record. Turning that
//! material into the AES key used for its contents is the job of a
//! [`KeyResolver`]; deriving class keys from a backup passphrase happens
//! outside this crate, so the default resolver expects the record to already
//! hold the unwrapped key.

use std::fmt;

use zeroize::Zeroizing;

use super::CipherError;
use super::cbc::{BlockCipher, KEY_SIZE};
use crate::backup::EntryKey;

/// Unwrapped AES-256 key for one entry's contents.
///
/// The key bytes are zeroized on drop and redacted from `Debug` output.
#[derive(Clone)]
pub struct ContentKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl ContentKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let array: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CipherError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self::new(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Build the block cipher for this key.
    pub fn cipher(&self) -> BlockCipher {
        BlockCipher::new(&self.bytes)
    }
}

/// Resolves the stored key material of an entry into its content key.
pub trait KeyResolver: Send + Sync + fmt::Debug {
    /// `stored` is the encryption-key field of the entry's manifest record.
    fn resolve(&self, key: &EntryKey, stored: &[u8]) -> Result<ContentKey, CipherError>;
}

/// Treats the stored key material as the raw 32-byte content key.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredKeyResolver;

impl KeyResolver for StoredKeyResolver {
    fn resolve(&self, _key: &EntryKey, stored: &[u8]) -> Result<ContentKey, CipherError> {
        ContentKey::from_slice(stored)
    }
}
