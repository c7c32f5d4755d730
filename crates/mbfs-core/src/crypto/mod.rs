//! Cryptographic primitives for backup archives: the SHA-1 digest used for
//! storage names and content digests, AES-256-CBC block chaining, and content
//! key resolution.

pub mod cbc;
pub mod digest;
pub mod keys;

use thiserror::Error;

/// Errors raised by the cipher primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// The stored key material does not fit the cipher.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A ciphertext or plaintext run is not a whole number of blocks.
    #[error("Buffer of {len} bytes is not a multiple of the {block_size}-byte block size")]
    UnalignedLength { len: usize, block_size: usize },
}

pub use cbc::{BLOCK_SIZE, BlockCipher, KEY_SIZE, ZERO_IV};
pub use digest::{SHA1_LEN, Sha1Stream, sha1, sha1_hex};
pub use keys::{ContentKey, KeyResolver, StoredKeyResolver};
