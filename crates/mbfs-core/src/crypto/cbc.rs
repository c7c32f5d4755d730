//! AES-256-CBC over whole blocks.
//!
//! Chaining is applied block by block so callers can decrypt an arbitrary run
//! of blocks given only the ciphertext block that precedes it (or the IV for
//! the first block of a file). Padding is PKCS#7 with an all-zero IV, which is
//! what backup archives use for protected entries.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use generic_array::GenericArray;

use super::CipherError;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Initialization vector used for every protected entry.
pub const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Ciphertext length of a plaintext of `plain_len` bytes after PKCS#7 padding.
///
/// Padding always adds between 1 and 16 bytes, so an empty plaintext still
/// occupies one block.
#[inline]
pub fn padded_len(plain_len: u64) -> u64 {
    (plain_len / BLOCK_SIZE_U64 + 1) * BLOCK_SIZE_U64
}

/// Round `len` up to a whole number of blocks.
#[inline]
pub fn round_up_to_block(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE_U64) * BLOCK_SIZE_U64
}

/// Index of the block containing plaintext byte `offset`.
#[inline]
pub fn block_index(offset: u64) -> u64 {
    offset / BLOCK_SIZE_U64
}

/// Append PKCS#7 padding so `buf` becomes block aligned.
pub fn pad(buf: &mut Vec<u8>) {
    let pad_len = BLOCK_SIZE - buf.len() % BLOCK_SIZE;
    buf.resize(buf.len() + pad_len, pad_len as u8);
}

fn xor_in_place(block: &mut [u8], other: &[u8; BLOCK_SIZE]) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}

fn check_aligned(len: usize) -> Result<(), CipherError> {
    if len % BLOCK_SIZE != 0 {
        return Err(CipherError::UnalignedLength {
            len,
            block_size: BLOCK_SIZE,
        });
    }
    Ok(())
}

/// Keyed AES-256 block cipher with CBC chaining helpers.
///
/// Holds the expanded key schedule so repeated calls on an open file do not
/// re-derive it.
#[derive(Clone)]
pub struct BlockCipher {
    cipher: Aes256,
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    /// Decrypt whole blocks in place.
    ///
    /// `prev` is the ciphertext block immediately before `data` in the stream,
    /// or the IV when `data` starts at block 0.
    pub fn decrypt_blocks(
        &self,
        prev: &[u8; BLOCK_SIZE],
        data: &mut [u8],
    ) -> Result<(), CipherError> {
        check_aligned(data.len())?;
        let mut chain = *prev;
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            let mut saved = [0u8; BLOCK_SIZE];
            saved.copy_from_slice(block);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            xor_in_place(block, &chain);
            chain = saved;
        }
        Ok(())
    }

    /// Encrypt whole blocks in place, chaining from `prev`.
    pub fn encrypt_blocks(
        &self,
        prev: &[u8; BLOCK_SIZE],
        data: &mut [u8],
    ) -> Result<(), CipherError> {
        check_aligned(data.len())?;
        let mut chain = *prev;
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            xor_in_place(block, &chain);
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            chain.copy_from_slice(block);
        }
        Ok(())
    }
}
