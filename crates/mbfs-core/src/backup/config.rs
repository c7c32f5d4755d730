//! Options for loading and writing a manifest.

use std::sync::Arc;

use super::format::ManifestFormat;
use crate::crypto::{KeyResolver, StoredKeyResolver};

/// Default manifest file name inside an archive directory.
pub const MANIFEST_FILE_NAME: &str = "Manifest.mbdb";

/// How a [`Manifest`](super::Manifest) finds, parses and unlocks an archive.
#[derive(Debug, Clone)]
pub struct ManifestOptions {
    /// Name of the manifest file inside the archive directory.
    pub manifest_file_name: String,

    /// Byte layout of the manifest file.
    pub format: ManifestFormat,

    /// Turns stored per-entry key material into content keys.
    ///
    /// Default: [`StoredKeyResolver`], which expects raw 32-byte keys.
    pub key_resolver: Arc<dyn KeyResolver>,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            manifest_file_name: MANIFEST_FILE_NAME.to_string(),
            format: ManifestFormat::default(),
            key_resolver: Arc::new(StoredKeyResolver),
        }
    }
}

impl ManifestOptions {
    #[must_use]
    pub fn manifest_file_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_file_name = name.into();
        self
    }

    #[must_use]
    pub fn format(mut self, format: ManifestFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.key_resolver = resolver;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ByteOrder;

    #[test]
    fn test_defaults() {
        let options = ManifestOptions::default();
        assert_eq!(options.manifest_file_name, "Manifest.mbdb");
        assert_eq!(options.format, ManifestFormat::mbdb());
    }

    #[test]
    fn test_builder_pattern() {
        let format = ManifestFormat {
            byte_order: ByteOrder::Little,
            ..ManifestFormat::mbdb()
        };
        let options = ManifestOptions::default()
            .manifest_file_name("Other.mbdb")
            .format(format);
        assert_eq!(options.manifest_file_name, "Other.mbdb");
        assert_eq!(options.format.byte_order, ByteOrder::Little);
    }
}
