//! Manifest loading, querying, mutation and persistence against archives on
//! disk.

mod common;

use common::{ArchiveBuilder, key, sample_archive};
use mbfs_core::backup::MANIFEST_FILE_NAME;
use mbfs_core::{
    Entry, EntryKey, Manifest, ManifestError, ManifestFormat, ManifestOptions, NodeKind,
    PropertyValue,
};
use tempfile::TempDir;

// ===== Loading =====

#[test]
fn test_load_sample_archive() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();

    assert_eq!(manifest.len(), 7);
    assert!(!manifest.is_dirty());
    assert_eq!(manifest.version(), 5);
    assert_eq!(
        manifest.available_domains(),
        vec!["AppDomain-com.example".to_string(), "HomeDomain".to_string()]
    );

    let notes = manifest
        .entry_with_key(&key("HomeDomain", "Library/notes.txt"))
        .unwrap();
    assert_eq!(notes.kind(), NodeKind::File);
    assert_eq!(notes.file_length, 5);
    assert!(!notes.is_encrypted());

    let link = manifest
        .entry_with_key(&key("HomeDomain", "Library/link"))
        .unwrap();
    assert_eq!(link.link_target.as_deref(), Some("notes.txt"));
}

#[test]
fn test_next_inode_follows_highest_recorded() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    // Inodes 100..=106 are in use.
    assert_eq!(manifest.next_inode(), 107);
    assert_eq!(manifest.allocate_inode(), 107);
    assert_eq!(manifest.allocate_inode(), 108);
}

#[test]
fn test_missing_manifest_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = Manifest::load(dir.path()).unwrap_err();
    assert!(matches!(err, ManifestError::Io { .. }));
    assert!(err.to_string().contains("during load"));
}

#[test]
fn test_garbage_manifest_is_corrupt() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(MANIFEST_FILE_NAME), b"not a manifest").unwrap();
    let err = Manifest::load(dir.path()).unwrap_err();
    assert!(matches!(err, ManifestError::CorruptManifest { offset: 0, .. }));
}

#[test]
fn test_truncated_manifest_is_corrupt() {
    let dir = sample_archive();
    let path = dir.path().join(MANIFEST_FILE_NAME);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let err = Manifest::load(dir.path()).unwrap_err();
    match err {
        ManifestError::CorruptManifest { offset, .. } => assert!(offset > 6),
        other => panic!("expected CorruptManifest, got {other:?}"),
    }
}

#[test]
fn test_newer_version_is_rejected() {
    let dir = sample_archive();
    let path = dir.path().join(MANIFEST_FILE_NAME);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] = 9;
    std::fs::write(&path, &bytes).unwrap();

    let err = Manifest::load(dir.path()).unwrap_err();
    assert!(matches!(
        err,
        ManifestError::UnsupportedVersion { version: 9, .. }
    ));
}

#[test]
fn test_custom_manifest_file_name() {
    let dir = sample_archive();
    std::fs::rename(
        dir.path().join(MANIFEST_FILE_NAME),
        dir.path().join("Snapshot.mbdb"),
    )
    .unwrap();

    let options = ManifestOptions::default().manifest_file_name("Snapshot.mbdb");
    let manifest = Manifest::load_with_options(dir.path(), options).unwrap();
    assert_eq!(manifest.len(), 7);
    assert!(manifest.path().ends_with("Snapshot.mbdb"));
}

// ===== Creating =====

#[test]
fn test_create_then_load_empty() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::create(dir.path(), ManifestOptions::default()).unwrap();
    assert!(manifest.is_empty());
    assert!(!manifest.is_dirty());

    let reloaded = Manifest::load(dir.path()).unwrap();
    assert!(reloaded.is_empty());
    assert!(reloaded.available_domains().is_empty());
}

#[test]
fn test_create_refuses_existing_manifest() {
    let dir = sample_archive();
    let err = Manifest::create(dir.path(), ManifestOptions::default()).unwrap_err();
    assert!(matches!(err, ManifestError::Io { .. }));
    // The existing manifest is untouched.
    assert_eq!(Manifest::load(dir.path()).unwrap().len(), 7);
}

// ===== Directory views =====

#[test]
fn test_contents_of_directory_skips_implicit_nodes() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();

    let home = manifest
        .contents_of_directory(&EntryKey::domain_root("HomeDomain").unwrap())
        .unwrap();
    let names: Vec<_> = home.iter().map(|e| e.key().name().to_string()).collect();
    // "Media" has no record of its own.
    assert_eq!(names, vec!["Library"]);

    let listing = manifest
        .directory_listing(&EntryKey::domain_root("HomeDomain").unwrap())
        .unwrap();
    let names: Vec<_> = listing.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Library", "Media"]);
    assert!(listing[1].is_implicit());
    assert!(listing[1].is_directory());
}

#[test]
fn test_contents_in_record_order() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();

    let library = manifest
        .contents_of_directory(&key("HomeDomain", "Library"))
        .unwrap();
    let names: Vec<_> = library.iter().map(|e| e.key().name().to_string()).collect();
    assert_eq!(names, vec!["notes.txt", "secret.db", "link"]);
}

#[test]
fn test_contents_of_file_is_not_a_directory() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let err = manifest
        .contents_of_directory(&key("HomeDomain", "Library/notes.txt"))
        .unwrap_err();
    assert!(matches!(err, ManifestError::NotADirectory { .. }));

    let err = manifest
        .contents_of_directory(&key("HomeDomain", "Nowhere"))
        .unwrap_err();
    assert!(matches!(err, ManifestError::NotFound { .. }));
}

#[test]
fn test_implicit_nodes_exist() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    assert!(manifest.node_exists(&EntryKey::root()));
    assert!(manifest.node_exists(&key("HomeDomain", "Media/DCIM")));
    assert!(manifest.entry_with_key(&key("HomeDomain", "Media/DCIM")).is_none());
    assert!(!manifest.node_exists(&key("HomeDomain", "Media/Other")));
}

// ===== Mutation =====

#[test]
fn test_add_entry_twice_is_duplicate() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let k = key("AppDomain-com.example", "Documents/a.txt");

    manifest.add_entry(Entry::file(k.clone(), 0o644)).unwrap();
    let count = manifest.len();
    let err = manifest.add_entry(Entry::file(k.clone(), 0o644)).unwrap_err();

    assert!(matches!(err, ManifestError::DuplicateKey { key } if key == k));
    assert_eq!(manifest.len(), count);
}

#[test]
fn test_remove_entry_keeps_storage_file() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let k = key("HomeDomain", "Library/notes.txt");

    let removed = manifest.remove_entry_with_key(&k).unwrap();
    assert_eq!(removed.file_length, 5);
    assert!(manifest.entry_with_key(&k).is_none());
    assert!(manifest.is_dirty());
    assert!(manifest.storage_path(&k).exists());

    assert!(matches!(
        manifest.remove_entry_with_key(&k),
        Err(ManifestError::NotFound { .. })
    ));
}

#[test]
fn test_removing_last_child_prunes_implicit_parents() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    manifest
        .remove_entry_with_key(&key("HomeDomain", "Media/DCIM/photo.jpg"))
        .unwrap();
    assert!(!manifest.node_exists(&key("HomeDomain", "Media/DCIM")));
    assert!(!manifest.node_exists(&key("HomeDomain", "Media")));
}

#[test]
fn test_move_tree_rekeys_descendants() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let from = key("HomeDomain", "Library");
    let to = key("HomeDomain", "Archive");
    let id = manifest.entry_id(&key("HomeDomain", "Library/notes.txt")).unwrap();

    let moves = manifest.move_tree(&from, &to).unwrap();
    assert_eq!(moves.len(), 4);
    assert!(manifest.entry_with_key(&from).is_none());
    assert_eq!(
        manifest.entry_id(&key("HomeDomain", "Archive/notes.txt")),
        Some(id)
    );
    // Storage files are left for the caller.
    assert!(manifest.storage_path(&key("HomeDomain", "Library/notes.txt")).exists());
}

#[test]
fn test_move_tree_collision_changes_nothing() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    manifest
        .add_entry(Entry::file(key("HomeDomain", "Other/notes.txt"), 0o644))
        .unwrap();

    let err = manifest
        .move_tree(&key("HomeDomain", "Library"), &key("HomeDomain", "Other"))
        .unwrap_err();
    assert!(matches!(err, ManifestError::DuplicateKey { .. }));
    assert!(manifest.entry_with_key(&key("HomeDomain", "Library/secret.db")).is_some());
    assert!(manifest.entry_with_key(&key("HomeDomain", "Other/secret.db")).is_none());
}

#[test]
fn test_move_tree_into_itself_is_rejected() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    assert!(manifest
        .move_tree(&key("HomeDomain", "Library"), &key("HomeDomain", "Library/sub"))
        .is_err());
}

#[test]
fn test_update_entry_marks_dirty() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let k = key("HomeDomain", "Library/notes.txt");

    let old_mode = manifest.update_entry(&k, |e| {
        let old = e.permissions();
        e.set_permissions(0o600);
        old
    });
    assert_eq!(old_mode.unwrap(), 0o644);
    assert!(manifest.is_dirty());
    assert_eq!(manifest.entry_with_key(&k).unwrap().permissions(), 0o600);
}

// ===== Persistence =====

#[test]
fn test_flush_and_reload() {
    let dir = sample_archive();
    let manifest = Manifest::load(dir.path()).unwrap();
    let k = key("AppDomain-com.example", "Documents");
    let mut entry = Entry::directory(k.clone(), 0o700).with_inode(500);
    entry.set_property_value("com.apple.backup.flags", 3i64);
    entry.set_property_value("com.apple.backup.label", "docs");
    entry.set_property_value("com.apple.backup.excluded", false);
    entry.set_property_value("com.apple.backup.blob", vec![0x61u8, 0x62, 0x63]);
    manifest.add_entry(entry).unwrap();
    manifest
        .remove_entry_with_key(&key("HomeDomain", "Library/link"))
        .unwrap();

    let before = manifest.entries();

    assert!(manifest.flush_if_dirty().unwrap());
    assert!(!manifest.is_dirty());
    assert!(!manifest.flush_if_dirty().unwrap());

    let reloaded = Manifest::load(dir.path()).unwrap();
    assert_eq!(reloaded.entries(), before);
    assert_eq!(reloaded.len(), 7);
    assert_eq!(reloaded.next_inode(), 501);
    let docs = reloaded.entry_with_key(&k).unwrap();
    assert_eq!(docs.permissions(), 0o700);
    assert_eq!(
        docs.property_value("com.apple.backup.flags"),
        Some(&PropertyValue::Integer(3))
    );
    assert_eq!(
        docs.property_value("com.apple.backup.excluded"),
        Some(&PropertyValue::Boolean(false))
    );
    assert_eq!(
        docs.property_value("com.apple.backup.blob"),
        Some(&PropertyValue::Bytes(b"abc".to_vec()))
    );
    assert!(reloaded.entry_with_key(&key("HomeDomain", "Library/link")).is_none());
}

#[test]
fn test_failed_flush_keeps_state_dirty() {
    let outer = TempDir::new().unwrap();
    let archive = outer.path().join("archive");
    let parked = outer.path().join("parked");
    let source = sample_archive();
    std::fs::create_dir(&archive).unwrap();
    for item in std::fs::read_dir(source.path()).unwrap() {
        let item = item.unwrap();
        std::fs::copy(item.path(), archive.join(item.file_name())).unwrap();
    }

    let manifest = Manifest::load(&archive).unwrap();
    manifest
        .update_entry(&key("HomeDomain", "Library"), |e| e.user_id = 777)
        .unwrap();
    let before = manifest.entries();

    // archive path now names a regular file, so no temp file can be created in it
    std::fs::rename(&archive, &parked).unwrap();
    std::fs::write(&archive, b"not a directory").unwrap();

    let err = manifest.flush_changes().unwrap_err();
    assert!(matches!(err, ManifestError::WriteFailed { .. }), "{err:?}");
    assert!(manifest.is_dirty());
    assert_eq!(manifest.entries(), before);

    std::fs::remove_file(&archive).unwrap();
    std::fs::rename(&parked, &archive).unwrap();
    manifest.flush_changes().unwrap();
    assert!(!manifest.is_dirty());

    let reloaded = Manifest::load(&archive).unwrap();
    assert_eq!(reloaded.entries(), before);
    assert_eq!(
        reloaded.entry_with_key(&key("HomeDomain", "Library")).unwrap().user_id,
        777
    );
}

#[test]
fn test_flush_leaves_no_temporary_files() {
    let dir = sample_archive();
    let before = std::fs::read_dir(dir.path()).unwrap().count();
    let manifest = Manifest::load(dir.path()).unwrap();
    manifest
        .update_entry(&key("HomeDomain", "Library"), |e| e.user_id = 501)
        .unwrap();
    manifest.flush_changes().unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), before);
}

#[test]
fn test_little_endian_family_round_trip() {
    let dir = TempDir::new().unwrap();
    let format = ManifestFormat {
        byte_order: mbfs_core::cursor::ByteOrder::Little,
        ..ManifestFormat::default()
    };
    let options = ManifestOptions::default().format(format);

    let manifest = Manifest::create(dir.path(), options.clone()).unwrap();
    manifest
        .add_entry(Entry::file(key("HomeDomain", "a.txt"), 0o644).with_inode(70_000))
        .unwrap();
    manifest.flush_changes().unwrap();

    let reloaded = Manifest::load_with_options(dir.path(), options).unwrap();
    assert_eq!(
        reloaded.entry_with_key(&key("HomeDomain", "a.txt")).unwrap().inode,
        70_000
    );
}

#[test]
fn test_builder_archive_without_storage() {
    let dir = ArchiveBuilder::new()
        .domain("HomeDomain")
        .missing_file("HomeDomain", "gone.bin", 32)
        .build();
    let manifest = Manifest::load(dir.path()).unwrap();
    let k = key("HomeDomain", "gone.bin");
    assert_eq!(manifest.entry_with_key(&k).unwrap().file_length, 32);
    assert!(!manifest.storage_path(&k).exists());
}
