//! Entry-level operations that touch storage.

use tracing::{debug, instrument};

use super::entry::{Entry, PropertyValue};
use super::key::EntryKey;
use super::manifest::{EntryId, Manifest, ManifestError};
use crate::fs::file::{Disposition, FileError, OpenMode, OpenedFile};

/// A reference to one entry of a [`Manifest`].
///
/// The handle names the entry by id, so it follows the entry across moves.
/// Operations fail with `NotFound` once the entry has been removed.
#[derive(Debug, Clone)]
pub struct EntryHandle {
    manifest: Manifest,
    id: EntryId,
}

impl EntryHandle {
    pub(crate) fn new(manifest: Manifest, id: EntryId) -> Self {
        Self { manifest, id }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Snapshot of the entry record.
    pub fn entry(&self) -> Option<Entry> {
        self.manifest.entry_by_id(self.id)
    }

    pub fn key(&self) -> Option<EntryKey> {
        self.entry().map(|e| e.key().clone())
    }

    /// Open the existing storage file.
    pub fn open_with_mode(&self, mode: OpenMode) -> Result<OpenedFile, FileError> {
        OpenedFile::open(&self.manifest, self.id, mode, Disposition::Open)
    }

    /// Create the storage file and open it.
    ///
    /// An existing storage file is an error unless `mode` truncates, in which
    /// case its contents are discarded. Encrypted entries start as one block
    /// of padding.
    pub fn creat_with_mode(&self, mode: OpenMode) -> Result<OpenedFile, FileError> {
        OpenedFile::open(&self.manifest, self.id, mode, Disposition::Create)
    }

    /// Read the whole plaintext. Meant for small entries.
    #[instrument(level = "debug", skip(self), fields(id = %self.id))]
    pub fn contents(&self) -> Result<Vec<u8>, FileError> {
        let mut file = self.open_with_mode(OpenMode::READ_ONLY)?;
        let len = usize::try_from(file.len()?).map_err(|_| FileError::OutOfRange {
            reason: "entry too large to read into memory".to_string(),
        })?;
        let data = file.read_range(0, len)?;
        file.close()?;
        Ok(data)
    }

    /// Replace the whole plaintext with `data`, creating the storage file if
    /// it is missing.
    #[instrument(level = "debug", skip(self, data), fields(id = %self.id, len = data.len()))]
    pub fn update_contents(&self, data: &[u8]) -> Result<(), FileError> {
        let mut file = self.creat_with_mode(OpenMode::WRITE_ONLY.truncating())?;
        file.write_at(data, 0)?;
        file.close()?;
        debug!("Replaced entry contents");
        Ok(())
    }

    pub fn property_value(&self, name: &str) -> Option<PropertyValue> {
        self.entry()
            .and_then(|e| e.property_value(name).cloned())
    }

    pub fn set_property_value(
        &self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<(), ManifestError> {
        let name = name.into();
        let value = value.into();
        self.manifest
            .update_entry_by_id(self.id, |e| e.set_property_value(name, value))
            .ok_or_else(|| ManifestError::NotFound {
                key: self.key().unwrap_or_default(),
            })
    }

    /// Compare the recorded digest with the SHA-1 of the current plaintext.
    ///
    /// `None` when the entry records no digest.
    pub fn verify_contents(&self) -> Result<Option<bool>, FileError> {
        let Some(expected) = self.entry().and_then(|e| e.digest) else {
            return Ok(None);
        };
        let mut file = self.open_with_mode(OpenMode::READ_ONLY)?;
        let actual = file.plaintext_digest()?;
        file.close()?;
        Ok(Some(actual.as_slice() == expected.as_slice()))
    }
}
