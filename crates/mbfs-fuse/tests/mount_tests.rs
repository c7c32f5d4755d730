//! Real-mount tests for the FUSE filesystem.
//!
//! Run: `cargo test -p mbfs-fuse --features fuse-tests`

#![cfg(all(unix, feature = "fuse-tests"))]

use mbfs_core::mount::{MountError, key_for_path};
use mbfs_core::{
    Entry, EntryKey, Manifest, ManifestOptions, MountBackend, MountSession,
};
use mbfs_fuse::{FuseBackend, MountConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Archive with `HomeDomain/Library/notes.txt` = "hello".
fn build_archive() -> TempDir {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::create(dir.path(), ManifestOptions::default()).unwrap();
    let home = EntryKey::domain_root("HomeDomain").unwrap();
    let library = EntryKey::new("HomeDomain", "Library").unwrap();
    let notes = EntryKey::new("HomeDomain", "Library/notes.txt").unwrap();
    manifest.add_entry(Entry::directory(home, 0o755)).unwrap();
    manifest.add_entry(Entry::directory(library, 0o755)).unwrap();
    manifest.add_entry(Entry::file(notes.clone(), 0o644)).unwrap();
    manifest
        .handle(&notes)
        .unwrap()
        .update_contents(b"hello")
        .unwrap();
    manifest.flush_changes().unwrap();
    dir
}

struct TestMount {
    session: Option<Box<dyn MountSession>>,
    mount_path: PathBuf,
    archive: TempDir,
    _mount_dir: TempDir,
}

impl TestMount {
    fn new(config: MountConfig) -> Option<Self> {
        let backend = FuseBackend::new(config);
        if !backend.is_available() {
            eprintln!("Skipping: {}", backend.unavailable_reason().unwrap_or_default());
            return None;
        }
        let archive = build_archive();
        let mount_dir = TempDir::new().unwrap();
        let mount_path = mount_dir.path().join("mnt");
        fs::create_dir(&mount_path).unwrap();
        match backend.mount(archive.path(), &mount_path) {
            Ok(session) => Some(Self {
                session: Some(session),
                mount_path,
                archive,
                _mount_dir: mount_dir,
            }),
            Err(MountError::Mount(e)) => {
                eprintln!("Skipping: mount failed: {e}");
                None
            }
            Err(e) => panic!("unexpected mount error: {e}"),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative)
    }

    /// Unmount and hand back the archive directory.
    fn finish(mut self) -> TempDir {
        if let Some(session) = self.session.take() {
            session.unmount().unwrap();
        }
        self.archive
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ===== Browsing =====

#[test]
fn test_domains_at_root() {
    let Some(mount) = TestMount::new(MountConfig::default()) else {
        return;
    };
    assert_eq!(names(&mount.mount_path), vec!["HomeDomain"]);
    assert_eq!(names(&mount.path("HomeDomain/Library")), vec!["notes.txt"]);
    mount.finish();
}

#[test]
fn test_read_file() {
    let Some(mount) = TestMount::new(MountConfig::default()) else {
        return;
    };
    let path = mount.path("HomeDomain/Library/notes.txt");
    assert_eq!(fs::read(&path).unwrap(), b"hello");
    assert_eq!(fs::metadata(&path).unwrap().len(), 5);
    mount.finish();
}

// ===== Writing =====

#[test]
fn test_write_persists_after_unmount() {
    let Some(mount) = TestMount::new(MountConfig::default()) else {
        return;
    };
    fs::create_dir(mount.path("HomeDomain/Documents")).unwrap();
    fs::write(mount.path("HomeDomain/Documents/todo.txt"), b"buy milk").unwrap();
    fs::rename(
        mount.path("HomeDomain/Library/notes.txt"),
        mount.path("HomeDomain/Documents/notes.txt"),
    )
    .unwrap();
    assert_eq!(
        fs::read(mount.path("HomeDomain/Documents/todo.txt")).unwrap(),
        b"buy milk"
    );
    let archive = mount.finish();

    let manifest = Manifest::load(archive.path()).unwrap();
    let contents = |path: &str| {
        let key = key_for_path(path).unwrap();
        manifest.handle(&key).map(|h| h.contents().unwrap())
    };
    assert_eq!(contents("/HomeDomain/Documents/todo.txt").unwrap(), b"buy milk");
    assert_eq!(contents("/HomeDomain/Documents/notes.txt").unwrap(), b"hello");
    assert!(contents("/HomeDomain/Library/notes.txt").is_none());
}

#[test]
fn test_read_only_mount_rejects_writes() {
    let Some(mount) = TestMount::new(MountConfig::default().read_only(true)) else {
        return;
    };
    let err = fs::write(mount.path("HomeDomain/Library/new.txt"), b"x").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EROFS));
    assert_eq!(fs::read(mount.path("HomeDomain/Library/notes.txt")).unwrap(), b"hello");
    mount.finish();
}
