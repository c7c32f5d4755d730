//! Shared fixtures: build small archives on disk.

#![allow(dead_code)]

use std::path::Path;

use mbfs_core::crypto::cbc::pad;
use mbfs_core::crypto::{BlockCipher, ZERO_IV, sha1};
use mbfs_core::{Entry, EntryKey, ManifestFormat};
use tempfile::TempDir;

pub const KEY: [u8; 32] = [0x5a; 32];

/// Route library logs to the test output. Set `RUST_LOG=mbfs_core=trace` to
/// see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(domain: &str, path: &str) -> EntryKey {
    EntryKey::new(domain, path).expect("valid key")
}

/// AES-256-CBC with a zero IV and PKCS#7 padding, as stored in archives.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let mut data = plaintext.to_vec();
    pad(&mut data);
    BlockCipher::new(key)
        .encrypt_blocks(&ZERO_IV, &mut data)
        .expect("aligned");
    data
}

pub fn decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    let mut data = ciphertext.to_vec();
    BlockCipher::new(key)
        .decrypt_blocks(&ZERO_IV, &mut data)
        .expect("aligned");
    data
}

/// Collects entries and their storage bytes, then writes an archive.
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<Entry>,
    storage: Vec<(EntryKey, Vec<u8>)>,
    next_inode: u64,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            next_inode: 100,
            ..Self::default()
        }
    }

    fn push(mut self, mut entry: Entry) -> Self {
        entry.inode = self.next_inode;
        entry.modified_time = 1_300_000_000;
        entry.accessed_time = 1_300_000_000;
        entry.created_time = 1_300_000_000;
        self.next_inode += 1;
        self.entries.push(entry);
        self
    }

    pub fn domain(self, domain: &str) -> Self {
        self.directory(domain, "")
    }

    pub fn directory(self, domain: &str, path: &str) -> Self {
        self.push(Entry::new(key(domain, path), 0o040755))
    }

    /// A plain file with a recorded digest.
    pub fn file(mut self, domain: &str, path: &str, contents: &[u8]) -> Self {
        let mut entry = Entry::new(key(domain, path), 0o100644);
        entry.file_length = contents.len() as u64;
        entry.digest = Some(sha1(contents).to_vec());
        self.storage.push((entry.key().clone(), contents.to_vec()));
        self.push(entry)
    }

    /// A file whose record exists but whose storage file does not.
    pub fn missing_file(self, domain: &str, path: &str, len: u64) -> Self {
        let mut entry = Entry::new(key(domain, path), 0o100644);
        entry.file_length = len;
        self.push(entry)
    }

    pub fn encrypted_file(mut self, domain: &str, path: &str, contents: &[u8]) -> Self {
        let mut entry = Entry::new(key(domain, path), 0o100600);
        entry.file_length = contents.len() as u64;
        entry.encryption_key = Some(KEY.to_vec());
        self.storage
            .push((entry.key().clone(), encrypt(&KEY, contents)));
        self.push(entry)
    }

    pub fn symlink(self, domain: &str, path: &str, target: &str) -> Self {
        let mut entry = Entry::new(key(domain, path), 0o120755);
        entry.link_target = Some(target.to_string());
        self.push(entry)
    }

    /// Raw storage bytes for an existing key, overriding what was written.
    pub fn raw_storage(mut self, domain: &str, path: &str, bytes: &[u8]) -> Self {
        let key = key(domain, path);
        self.storage.retain(|(k, _)| *k != key);
        self.storage.push((key, bytes.to_vec()));
        self
    }

    pub fn write_to(self, dir: &Path) {
        let bytes = ManifestFormat::default()
            .encode(&self.entries)
            .expect("encodable");
        std::fs::write(dir.join("Manifest.mbdb"), bytes).expect("write manifest");
        for (key, data) in self.storage {
            std::fs::write(dir.join(key.storage_filename()), data).expect("write storage");
        }
    }

    pub fn build(self) -> TempDir {
        init_tracing();
        let dir = TempDir::new().expect("tempdir");
        self.write_to(dir.path());
        dir
    }
}

/// The archive most tests start from.
pub fn sample_archive() -> TempDir {
    ArchiveBuilder::new()
        .domain("HomeDomain")
        .directory("HomeDomain", "Library")
        .file("HomeDomain", "Library/notes.txt", b"hello")
        .encrypted_file("HomeDomain", "Library/secret.db", b"0123456789")
        .symlink("HomeDomain", "Library/link", "notes.txt")
        .file("HomeDomain", "Media/DCIM/photo.jpg", b"jpeg bytes")
        .domain("AppDomain-com.example")
        .build()
}
