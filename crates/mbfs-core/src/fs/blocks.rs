//! Block-level access to encrypted storage files.
//!
//! Only the blocks that cover plaintext are ever read: the trailing padding
//! block is rewritten on every change but never trusted, since the entry's
//! file length already says where the plaintext ends.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use super::file::{FileContext, FileError};
use crate::crypto::BlockCipher;
use crate::crypto::cbc::{BLOCK_SIZE, ZERO_IV, block_index, pad, round_up_to_block};

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Chunk size for whole-file passes; a multiple of the block size.
const CHUNK_SIZE: usize = 64 * 1024;

fn io_fault(source: io::Error, context: &FileContext) -> FileError {
    FileError::IoFault {
        source,
        context: context.clone(),
    }
}

fn corrupt(reason: impl Into<String>, context: &FileContext) -> FileError {
    FileError::CorruptCipherState {
        reason: reason.into(),
        context: context.clone(),
    }
}

/// Fill `buf` from ciphertext at `at`. A short file is a corrupt cipher state.
fn read_ciphertext(
    file: &File,
    buf: &mut [u8],
    at: u64,
    context: &FileContext,
) -> Result<(), FileError> {
    file.read_exact_at(buf, at).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            corrupt(
                format!("ciphertext ends before byte {}", at + buf.len() as u64),
                context,
            )
        } else {
            io_fault(e, context)
        }
    })
}

/// Chaining input for block `index`: the ciphertext block before it, or the IV.
fn chain_input(
    file: &File,
    index: u64,
    context: &FileContext,
) -> Result<[u8; BLOCK_SIZE], FileError> {
    if index == 0 {
        return Ok(ZERO_IV);
    }
    let mut prev = [0u8; BLOCK_SIZE];
    read_ciphertext(file, &mut prev, (index - 1) * BLOCK, context)?;
    Ok(prev)
}

/// Decrypt plaintext bytes `offset..offset + out.len()` into `out`.
///
/// The caller keeps the range inside the entry's file length.
pub(crate) fn read_plain(
    file: &File,
    cipher: &BlockCipher,
    offset: u64,
    out: &mut [u8],
    context: &FileContext,
) -> Result<(), FileError> {
    if out.is_empty() {
        return Ok(());
    }
    let first = block_index(offset);
    let last = block_index(offset + out.len() as u64 - 1);
    let start = first * BLOCK;

    let prev = chain_input(file, first, context)?;
    let mut blocks = vec![0u8; ((last - first + 1) * BLOCK) as usize];
    read_ciphertext(file, &mut blocks, start, context)?;
    cipher
        .decrypt_blocks(&prev, &mut blocks)
        .map_err(|e| corrupt(e.to_string(), context))?;

    let skip = (offset - start) as usize;
    out.copy_from_slice(&blocks[skip..skip + out.len()]);
    Ok(())
}

/// Re-encrypt everything from the block that holds the first changed byte to
/// the end of the file.
///
/// The plaintext grows or shrinks from `old_len` to `new_len` (new bytes are
/// zero) and `splice`, if given, is copied in at its offset. The tail is
/// handled `CHUNK_SIZE` bytes at a time: each chunk of old ciphertext is read
/// and decrypted before the same range is overwritten, and both chaining
/// blocks are carried to the next chunk. The last chunk is re-padded and the
/// file is cut to the new ciphertext length.
pub(crate) fn rewrite_tail(
    file: &File,
    cipher: &BlockCipher,
    old_len: u64,
    new_len: u64,
    splice: Option<(u64, &[u8])>,
    context: &FileContext,
) -> Result<(), FileError> {
    let changed_from = splice.map_or(new_len, |(at, _)| at);
    let first = block_index(changed_from.min(old_len).min(new_len));
    let start = first * BLOCK;

    let mut decrypt_chain = chain_input(file, first, context)?;
    let mut encrypt_chain = decrypt_chain;
    let covered = round_up_to_block(old_len).saturating_sub(start);
    let mut old = vec![0u8; covered.min(CHUNK_SIZE as u64) as usize];
    let mut chunk = Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE);
    let mut pos = start;
    loop {
        let remaining = new_len - pos;
        let is_last = remaining <= CHUNK_SIZE as u64;
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        chunk.clear();
        chunk.resize(want, 0);

        let kept = old_len.saturating_sub(pos).min(want as u64) as usize;
        if kept > 0 {
            let aligned = round_up_to_block(kept as u64) as usize;
            let old_blocks = &mut old[..aligned];
            read_ciphertext(file, old_blocks, pos, context)?;
            let mut next_chain = [0u8; BLOCK_SIZE];
            next_chain.copy_from_slice(&old_blocks[aligned - BLOCK_SIZE..]);
            cipher
                .decrypt_blocks(&decrypt_chain, old_blocks)
                .map_err(|e| corrupt(e.to_string(), context))?;
            decrypt_chain = next_chain;
            chunk[..kept].copy_from_slice(&old_blocks[..kept]);
        }

        if let Some((at, data)) = splice {
            let end = pos + want as u64;
            let from = at.max(pos);
            let to = (at + data.len() as u64).min(end);
            if from < to {
                chunk[(from - pos) as usize..(to - pos) as usize]
                    .copy_from_slice(&data[(from - at) as usize..(to - at) as usize]);
            }
        }

        if is_last {
            pad(&mut chunk);
        }
        cipher
            .encrypt_blocks(&encrypt_chain, &mut chunk)
            .map_err(|e| corrupt(e.to_string(), context))?;
        encrypt_chain.copy_from_slice(&chunk[chunk.len() - BLOCK_SIZE..]);
        file.write_all_at(&chunk, pos)
            .map_err(|e| io_fault(e, context))?;

        if is_last {
            return file
                .set_len(pos + chunk.len() as u64)
                .map_err(|e| io_fault(e, context));
        }
        pos += want as u64;
    }
}

/// Write the ciphertext of an empty plaintext: one block of padding.
pub(crate) fn write_empty(
    file: &File,
    cipher: &BlockCipher,
    context: &FileContext,
) -> Result<(), FileError> {
    rewrite_tail(file, cipher, 0, 0, None, context)
}

/// Feed the first `len` plaintext bytes of a storage file to `sink`, in order.
pub(crate) fn for_each_plain_chunk(
    file: &File,
    cipher: Option<&BlockCipher>,
    len: u64,
    context: &FileContext,
    mut sink: impl FnMut(&[u8]),
) -> Result<(), FileError> {
    let mut chain = ZERO_IV;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;
    while offset < len {
        let want = (len - offset).min(CHUNK_SIZE as u64) as usize;
        match cipher {
            Some(cipher) => {
                let aligned = round_up_to_block(want as u64) as usize;
                let chunk = &mut buf[..aligned];
                read_ciphertext(file, chunk, offset, context)?;
                let mut next_chain = [0u8; BLOCK_SIZE];
                next_chain.copy_from_slice(&chunk[aligned - BLOCK_SIZE..]);
                cipher
                    .decrypt_blocks(&chain, chunk)
                    .map_err(|e| corrupt(e.to_string(), context))?;
                chain = next_chain;
            }
            None => {
                file.read_exact_at(&mut buf[..want], offset)
                    .map_err(|e| io_fault(e, context))?;
            }
        }
        sink(&buf[..want]);
        offset += want as u64;
    }
    Ok(())
}
