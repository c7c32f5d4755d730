//! Slash-separated paths of the mounted namespace.
//!
//! The first path component is the domain and the rest is the path inside
//! it, so `/HomeDomain/Library/Preferences` names
//! `("HomeDomain", "Library/Preferences")` and `/` names the archive root.

use crate::backup::{EntryKey, KeyError};

/// Key named by a mount-relative path. Repeated slashes are ignored; `.` and
/// `..` components are rejected.
pub fn key_for_path(path: &str) -> Result<EntryKey, KeyError> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let Some(domain) = segments.next() else {
        return Ok(EntryKey::root());
    };
    let rest: Vec<&str> = segments.collect();
    if domain == "." || domain == ".." || rest.iter().any(|s| *s == "." || *s == "..") {
        return Err(KeyError::InvalidIdentity {
            domain: domain.to_string(),
            path: rest.join("/"),
            reason: "relative components are not allowed",
        });
    }
    EntryKey::new(domain, rest.join("/"))
}

/// Mount-relative path of `key`.
pub fn path_for_key(key: &EntryKey) -> String {
    let mut path = String::from("/");
    path.push_str(key.domain());
    if !key.path().is_empty() {
        path.push('/');
        path.push_str(key.path());
    }
    path
}
