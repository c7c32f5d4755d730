//! Offset-addressed access to an entry's storage file.
//!
//! An [`OpenedFile`] is obtained from an [`EntryHandle`](crate::EntryHandle)
//! and refers to its entry by [`EntryId`], so it keeps working if the entry is
//! re-keyed while open. Every operation holds the entry's mutex from the
//! manifest lock table, which serializes handles that share an entry.
//!
//! Encrypted entries are AES-256-CBC with a zero IV. Reads decrypt only the
//! blocks they touch. Writes and truncation re-encrypt from the first changed
//! block to the end of the file, so their cost grows with the distance from
//! the change to the end of the file.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use super::blocks;
use crate::backup::{Entry, EntryId, EntryKey, Manifest, ManifestError};
use crate::crypto::cbc::round_up_to_block;
use crate::crypto::{BLOCK_SIZE, BlockCipher, SHA1_LEN, Sha1Stream};

/// Access requested when opening an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    /// Discard existing contents on open. Requires `write`.
    pub truncate: bool,
}

impl OpenMode {
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        truncate: false,
    };
    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
        truncate: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        truncate: false,
    };

    #[must_use]
    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Translate POSIX `open(2)` flags.
    pub fn from_flags(flags: i32) -> Self {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            truncate: write && flags & libc::O_TRUNC != 0,
        }
    }
}

/// Context for file errors.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    pub key: Option<EntryKey>,
    /// Storage file on disk
    pub storage_path: Option<PathBuf>,
    pub operation: Option<&'static str>,
    pub offset: Option<u64>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, key: EntryKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(op) = self.operation {
            parts.push(format!("during {op}"));
        }
        if let Some(ref key) = self.key {
            parts.push(format!("entry {key}"));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("offset {offset}"));
        }
        if let Some(ref path) = self.storage_path {
            parts.push(format!("at {:?}", path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error {context}: {source}")]
    IoFault {
        #[source]
        source: io::Error,
        context: FileContext,
    },

    #[error("Corrupt cipher state {context}: {reason}")]
    CorruptCipherState { reason: String, context: FileContext },

    #[error("Out of range: {reason}")]
    OutOfRange { reason: String },

    #[error("Handle is closed {context}")]
    InvalidHandle { context: FileContext },

    #[error("Handle was not opened for writing {context}")]
    ReadOnlyHandle { context: FileContext },

    #[error("Storage file already exists {context}")]
    AlreadyExists { context: FileContext },

    #[error("Storage file not found {context}")]
    NotFound { context: FileContext },

    #[error("Not a regular file {context}")]
    NotAFile { context: FileContext },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Convert a caller-supplied signed offset.
pub fn checked_offset(offset: i64) -> Result<u64, FileError> {
    u64::try_from(offset).map_err(|_| FileError::OutOfRange {
        reason: format!("negative offset {offset}"),
    })
}

/// End of the range `offset..offset + len`, or `OutOfRange` on overflow.
pub fn checked_end(offset: u64, len: usize) -> Result<u64, FileError> {
    offset
        .checked_add(len as u64)
        .filter(|end| i64::try_from(*end).is_ok())
        .ok_or_else(|| FileError::OutOfRange {
            reason: format!("range at {offset} of {len} bytes overflows"),
        })
}

/// How [`OpenedFile::open`] treats the storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The storage file must exist.
    Open,
    /// The storage file must not exist, unless the mode truncates.
    Create,
}

/// A live handle on one entry's storage file.
///
/// Close with [`OpenedFile::close`] to see errors from the close-time
/// metadata refresh; dropping an open handle closes it and logs failures.
pub struct OpenedFile {
    manifest: Manifest,
    id: EntryId,
    key: EntryKey,
    storage_path: PathBuf,
    file: Option<File>,
    mode: OpenMode,
    cipher: Option<BlockCipher>,
    modified: bool,
}

impl fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedFile")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("storage_path", &self.storage_path)
            .field("open", &self.file.is_some())
            .field("mode", &self.mode)
            .field("encrypted", &self.cipher.is_some())
            .field("modified", &self.modified)
            .finish()
    }
}

impl OpenedFile {
    #[instrument(level = "debug", skip(manifest), fields(id = %id))]
    pub(crate) fn open(
        manifest: &Manifest,
        id: EntryId,
        mode: OpenMode,
        disposition: Disposition,
    ) -> Result<Self, FileError> {
        let _guard = manifest.locks().lock(id);

        let entry = manifest.entry_by_id(id).ok_or_else(|| FileError::NotFound {
            context: FileContext::new().with_operation("open"),
        })?;
        let key = entry.key().clone();
        let storage_path = manifest.storage_path(&key);
        let context = FileContext::new()
            .with_key(key.clone())
            .with_storage_path(&storage_path)
            .with_operation("open");

        if entry.is_directory() || entry.is_symlink() {
            return Err(FileError::NotAFile { context });
        }
        if mode.truncate && !mode.write {
            return Err(FileError::ReadOnlyHandle { context });
        }

        let cipher = match entry.encryption_key.as_deref() {
            Some(stored) => Some(
                manifest
                    .options()
                    .key_resolver
                    .resolve(&key, stored)
                    .map_err(|e| FileError::CorruptCipherState {
                        reason: e.to_string(),
                        context: context.clone(),
                    })?
                    .cipher(),
            ),
            None => None,
        };

        let mut options = OpenOptions::new();
        options.read(true).write(mode.write || disposition == Disposition::Create);
        if disposition == Disposition::Create {
            if mode.truncate {
                options.create(true).truncate(true);
            } else {
                options.create_new(true);
            }
        }
        let file = options.open(&storage_path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => FileError::AlreadyExists {
                context: context.clone(),
            },
            io::ErrorKind::NotFound => FileError::NotFound {
                context: context.clone(),
            },
            _ => FileError::IoFault {
                source: e,
                context: context.clone(),
            },
        })?;

        let reset = disposition == Disposition::Create || mode.truncate;
        if reset {
            file.set_len(0).map_err(|e| FileError::IoFault {
                source: e,
                context: context.clone(),
            })?;
            if let Some(cipher) = &cipher {
                blocks::write_empty(&file, cipher, &context)?;
            }
            manifest.update_entry_by_id(id, |e| e.file_length = 0);
        } else if cipher.is_some() {
            Self::check_ciphertext(&file, &entry, &context)?;
        }

        debug!(
            key = %key,
            encrypted = cipher.is_some(),
            write = mode.write,
            reset,
            "Opened entry"
        );
        Ok(Self {
            manifest: manifest.clone(),
            id,
            key,
            storage_path,
            file: Some(file),
            mode,
            cipher,
            modified: reset,
        })
    }

    fn check_ciphertext(file: &File, entry: &Entry, context: &FileContext) -> Result<(), FileError> {
        let len = file
            .metadata()
            .map_err(|e| FileError::IoFault {
                source: e,
                context: context.clone(),
            })?
            .len();
        if len % BLOCK_SIZE as u64 != 0 {
            warn!(key = %entry.key(), len, "Ciphertext is not block aligned");
            return Err(FileError::CorruptCipherState {
                reason: format!("ciphertext length {len} is not a multiple of {BLOCK_SIZE}"),
                context: context.clone(),
            });
        }
        if len < round_up_to_block(entry.file_length) {
            warn!(key = %entry.key(), len, file_length = entry.file_length, "Ciphertext too short");
            return Err(FileError::CorruptCipherState {
                reason: format!(
                    "ciphertext length {len} cannot hold {} bytes of plaintext",
                    entry.file_length
                ),
                context: context.clone(),
            });
        }
        Ok(())
    }

    fn context(&self, operation: &'static str) -> FileContext {
        FileContext::new()
            .with_key(self.key.clone())
            .with_storage_path(&self.storage_path)
            .with_operation(operation)
    }

    fn file(&self, operation: &'static str) -> Result<&File, FileError> {
        self.file.as_ref().ok_or_else(|| FileError::InvalidHandle {
            context: self.context(operation),
        })
    }

    fn writable_file(&self, operation: &'static str) -> Result<&File, FileError> {
        let file = self.file(operation)?;
        if !self.mode.write {
            return Err(FileError::ReadOnlyHandle {
                context: self.context(operation),
            });
        }
        Ok(file)
    }

    /// Current plaintext length from the manifest record.
    fn current_len(&self, operation: &'static str) -> Result<u64, FileError> {
        self.manifest
            .entry_by_id(self.id)
            .map(|e| e.file_length)
            .ok_or_else(|| FileError::NotFound {
                context: self.context(operation),
            })
    }

    pub fn entry_id(&self) -> EntryId {
        self.id
    }

    /// Key of the entry when it was opened.
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Plaintext length of the entry.
    pub fn len(&self) -> Result<u64, FileError> {
        self.file("len")?;
        let _guard = self.manifest.locks().lock(self.id);
        self.current_len("len")
    }

    /// Copy plaintext starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied: fewer than `buf.len()` near the end
    /// of the file and zero at or past it.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        let file = self.file("read")?;
        checked_end(offset, buf.len())?;
        let _guard = self.manifest.locks().lock(self.id);

        let len = self.current_len("read")?;
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let n = (len - offset).min(buf.len() as u64) as usize;
        let context = self.context("read").with_offset(offset);

        match &self.cipher {
            Some(cipher) => blocks::read_plain(file, cipher, offset, &mut buf[..n], &context)?,
            None => {
                let mut done = 0;
                while done < n {
                    match file.read_at(&mut buf[done..n], offset + done as u64) {
                        Ok(0) => break,
                        Ok(read) => done += read,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(FileError::IoFault { source: e, context }),
                    }
                }
                trace!(key = %self.key, offset, requested = buf.len(), read = done, "read");
                return Ok(done);
            }
        }

        trace!(key = %self.key, offset, requested = buf.len(), read = n, "read");
        Ok(n)
    }

    /// Read up to `len` bytes at `offset` into a new buffer.
    pub fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, FileError> {
        let mut buf = vec![0u8; len];
        let n = self.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    ///
    /// Returns the number of bytes written, which is always `data.len()`. An
    /// empty write never changes the length.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, FileError> {
        let file = self.writable_file("write")?;
        let end = checked_end(offset, data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        let _guard = self.manifest.locks().lock(self.id);

        let old_len = self.current_len("write")?;
        let new_len = old_len.max(end);
        let context = self.context("write").with_offset(offset);

        match &self.cipher {
            Some(cipher) => {
                blocks::rewrite_tail(file, cipher, old_len, new_len, Some((offset, data)), &context)?;
            }
            None => {
                if offset > old_len {
                    file.set_len(old_len).map_err(|e| FileError::IoFault {
                        source: e,
                        context: context.clone(),
                    })?;
                }
                file.write_all_at(data, offset)
                    .map_err(|e| FileError::IoFault { source: e, context })?;
            }
        }

        if new_len != old_len {
            self.manifest
                .update_entry_by_id(self.id, |e| e.file_length = new_len);
        }
        self.modified = true;
        trace!(key = %self.key, offset, len = data.len(), old_len, new_len, "write");
        Ok(data.len())
    }

    /// Truncate or zero-extend the plaintext to `new_len` bytes.
    pub fn set_len(&mut self, new_len: u64) -> Result<(), FileError> {
        let file = self.writable_file("truncate")?;
        checked_end(new_len, 0)?;
        let _guard = self.manifest.locks().lock(self.id);

        let old_len = self.current_len("truncate")?;
        let context = self.context("truncate").with_offset(new_len);
        match &self.cipher {
            Some(cipher) => blocks::rewrite_tail(file, cipher, old_len, new_len, None, &context)?,
            None => file
                .set_len(new_len)
                .map_err(|e| FileError::IoFault { source: e, context })?,
        }

        self.manifest
            .update_entry_by_id(self.id, |e| e.file_length = new_len);
        self.modified = true;
        debug!(key = %self.key, old_len, new_len, "Set length");
        Ok(())
    }

    /// SHA-1 of the current plaintext.
    pub fn plaintext_digest(&self) -> Result<[u8; SHA1_LEN], FileError> {
        let file = self.file("digest")?;
        let _guard = self.manifest.locks().lock(self.id);
        self.digest_locked(file)
    }

    fn digest_locked(&self, file: &File) -> Result<[u8; SHA1_LEN], FileError> {
        let len = self.current_len("digest")?;
        let mut hasher = Sha1Stream::new();
        blocks::for_each_plain_chunk(
            file,
            self.cipher.as_ref(),
            len,
            &self.context("digest"),
            |chunk| hasher.update(chunk),
        )?;
        Ok(hasher.finish())
    }

    /// Flush written bytes to the storage device.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file("sync")?
            .sync_data()
            .map_err(|e| FileError::IoFault {
                source: e,
                context: self.context("sync"),
            })
    }

    /// Release the storage file. Closing twice is a no-op.
    ///
    /// If the contents changed, the entry's modified time is set to now and a
    /// recorded digest is recomputed from the new plaintext.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn close(&mut self) -> Result<(), FileError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if !self.modified {
            return Ok(());
        }

        let _guard = self.manifest.locks().lock(self.id);
        file.sync_data().map_err(|e| FileError::IoFault {
            source: e,
            context: self.context("close"),
        })?;

        let has_digest = self
            .manifest
            .entry_by_id(self.id)
            .is_some_and(|e| e.digest.is_some());
        let digest = if has_digest {
            Some(self.digest_locked(&file)?)
        } else {
            None
        };
        self.manifest.update_entry_by_id(self.id, |e| {
            e.touch_modified();
            if let Some(digest) = digest {
                e.digest = Some(digest.to_vec());
            }
        });
        self.modified = false;
        debug!("Closed modified entry");
        Ok(())
    }
}

impl Drop for OpenedFile {
    fn drop(&mut self) {
        if self.file.is_some()
            && let Err(e) = self.close()
        {
            warn!(key = %self.key, error = %e, "Failed to close entry on drop");
        }
    }
}
