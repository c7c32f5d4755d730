//! Entry identities and their storage filenames.

use std::fmt;

use thiserror::Error;

use crate::crypto::sha1_hex;

/// Errors raised when building an [`EntryKey`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid entry identity ({domain:?}, {path:?}): {reason}")]
    InvalidIdentity {
        domain: String,
        path: String,
        reason: &'static str,
    },
}

/// Identity of a backed-up node: a domain plus a path relative to it.
///
/// An empty path names the top-level directory of a domain. The archive root,
/// which sits above all domains, is the only key with an empty domain.
///
/// Keys order by domain, then by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntryKey {
    domain: String,
    path: String,
}

impl EntryKey {
    pub fn new(domain: impl Into<String>, path: impl Into<String>) -> Result<Self, KeyError> {
        let domain = domain.into();
        let path = path.into();

        let reason = if domain.is_empty() && !path.is_empty() {
            Some("a path requires a domain")
        } else if domain.contains('/') {
            Some("domain may not contain '/'")
        } else if path.starts_with('/') || path.ends_with('/') {
            Some("path may not start or end with '/'")
        } else if path.contains("//") {
            Some("path may not contain empty segments")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(KeyError::InvalidIdentity {
                domain,
                path,
                reason,
            }),
            None => Ok(Self { domain, path }),
        }
    }

    /// The archive root, parent of every domain.
    pub fn root() -> Self {
        Self::default()
    }

    /// The top-level directory of `domain`.
    pub fn domain_root(domain: impl Into<String>) -> Result<Self, KeyError> {
        let domain = domain.into();
        if domain.is_empty() {
            return Err(KeyError::InvalidIdentity {
                domain,
                path: String::new(),
                reason: "domain may not be empty",
            });
        }
        Self::new(domain, "")
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.domain.is_empty()
    }

    pub fn is_domain_root(&self) -> bool {
        !self.domain.is_empty() && self.path.is_empty()
    }

    /// Name of the file holding this node's contents in the archive directory:
    /// lowercase hex SHA-1 of `domain + "-" + path`.
    pub fn storage_filename(&self) -> String {
        sha1_hex(format!("{}-{}", self.domain, self.path).as_bytes())
    }

    /// Tree segments from the archive root: the domain, then each path component.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        let domain = (!self.domain.is_empty()).then_some(self.domain.as_str());
        let path = (!self.path.is_empty()).then(|| self.path.split('/'));
        domain.into_iter().chain(path.into_iter().flatten())
    }

    /// Final segment; the domain for a domain root, empty for the archive root.
    pub fn name(&self) -> &str {
        if self.path.is_empty() {
            return &self.domain;
        }
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn parent(&self) -> Option<EntryKey> {
        if self.is_root() {
            return None;
        }
        if self.path.is_empty() {
            return Some(Self::root());
        }
        let parent_path = match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        };
        Some(Self {
            domain: self.domain.clone(),
            path: parent_path.to_string(),
        })
    }

    /// Key of the child `name` below this node.
    ///
    /// Below the archive root, `name` becomes a domain.
    pub fn join(&self, name: &str) -> Result<EntryKey, KeyError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(KeyError::InvalidIdentity {
                domain: self.domain.clone(),
                path: format!("{}/{}", self.path, name),
                reason: "invalid child name",
            });
        }
        if self.is_root() {
            return Self::domain_root(name);
        }
        if self.path.is_empty() {
            return Self::new(self.domain.clone(), name);
        }
        Self::new(self.domain.clone(), format!("{}/{}", self.path, name))
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &EntryKey) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        if self.domain != ancestor.domain {
            return false;
        }
        if ancestor.path.is_empty() {
            return !self.path.is_empty();
        }
        self.path.len() > ancestor.path.len()
            && self.path.starts_with(&ancestor.path)
            && self.path.as_bytes()[ancestor.path.len()] == b'/'
    }

    /// Re-express `self`, a descendant of (or equal to) `from`, below `to`.
    pub fn rebase(&self, from: &EntryKey, to: &EntryKey) -> Option<Result<EntryKey, KeyError>> {
        if self == from {
            return Some(Ok(to.clone()));
        }
        if !self.is_descendant_of(from) || from.is_root() {
            return None;
        }
        let suffix = if from.path.is_empty() {
            self.path.as_str()
        } else {
            &self.path[from.path.len() + 1..]
        };
        let path = if to.path.is_empty() {
            suffix.to_string()
        } else {
            format!("{}/{}", to.path, suffix)
        };
        Some(Self::new(to.domain.clone(), path))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}:{}", self.domain, self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_filename_known_value() {
        let key = EntryKey::new("HomeDomain", "Library/SMS/sms.db").unwrap();
        assert_eq!(
            key.storage_filename(),
            "3d0d7e5fb2ce288813306e4d4636395e047a3d28"
        );
    }

    #[test]
    fn test_storage_filename_is_stable() {
        let a = EntryKey::new("AppDomain", "Library/file.txt").unwrap();
        let b = EntryKey::new("AppDomain", "Library/file.txt").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.storage_filename(), b.storage_filename());
        assert_eq!(a.storage_filename(), a.storage_filename());
        assert_eq!(a.storage_filename().len(), 40);
    }

    #[test]
    fn test_distinct_keys_distinct_names() {
        let a = EntryKey::new("AppDomain", "a").unwrap();
        let b = EntryKey::new("AppDomain", "b").unwrap();
        let c = EntryKey::new("OtherDomain", "a").unwrap();
        assert_ne!(a.storage_filename(), b.storage_filename());
        assert_ne!(a.storage_filename(), c.storage_filename());
    }

    #[test]
    fn test_invalid_identities() {
        assert!(EntryKey::new("", "Library").is_err());
        assert!(EntryKey::new("Home/Domain", "x").is_err());
        assert!(EntryKey::new("HomeDomain", "/abs").is_err());
        assert!(EntryKey::new("HomeDomain", "trailing/").is_err());
        assert!(EntryKey::new("HomeDomain", "a//b").is_err());
        assert!(EntryKey::domain_root("").is_err());
        assert!(EntryKey::new("", "").unwrap().is_root());
    }

    #[test]
    fn test_ordering_domain_first() {
        let a = EntryKey::new("A", "z").unwrap();
        let b = EntryKey::new("B", "a").unwrap();
        let a2 = EntryKey::new("A", "zz").unwrap();
        assert!(a < b);
        assert!(a < a2);
    }

    #[test]
    fn test_parent_and_name() {
        let key = EntryKey::new("HomeDomain", "Library/Prefs/x.plist").unwrap();
        assert_eq!(key.name(), "x.plist");
        let parent = key.parent().unwrap();
        assert_eq!(parent.path(), "Library/Prefs");
        let top = EntryKey::new("HomeDomain", "Library").unwrap();
        assert!(top.parent().unwrap().is_domain_root());
        assert!(EntryKey::domain_root("HomeDomain").unwrap().parent().unwrap().is_root());
        assert_eq!(EntryKey::root().parent(), None);
        assert_eq!(EntryKey::domain_root("HomeDomain").unwrap().name(), "HomeDomain");
    }

    #[test]
    fn test_join() {
        let root = EntryKey::root();
        let domain = root.join("HomeDomain").unwrap();
        assert!(domain.is_domain_root());
        let lib = domain.join("Library").unwrap();
        assert_eq!(lib.path(), "Library");
        let file = lib.join("a.txt").unwrap();
        assert_eq!(file.path(), "Library/a.txt");
        assert!(lib.join("..").is_err());
        assert!(lib.join("a/b").is_err());
        assert!(lib.join("").is_err());
    }

    #[test]
    fn test_segments() {
        let key = EntryKey::new("HomeDomain", "a/b").unwrap();
        assert_eq!(key.segments().collect::<Vec<_>>(), ["HomeDomain", "a", "b"]);
        assert_eq!(EntryKey::root().segments().count(), 0);
        assert_eq!(
            EntryKey::domain_root("D").unwrap().segments().collect::<Vec<_>>(),
            ["D"]
        );
    }

    #[test]
    fn test_descendants_and_rebase() {
        let dir = EntryKey::new("D", "a").unwrap();
        let child = EntryKey::new("D", "a/b/c").unwrap();
        let sibling = EntryKey::new("D", "ab").unwrap();
        assert!(child.is_descendant_of(&dir));
        assert!(!sibling.is_descendant_of(&dir));
        assert!(!dir.is_descendant_of(&dir));

        let target = EntryKey::new("E", "x/y").unwrap();
        let moved = child.rebase(&dir, &target).unwrap().unwrap();
        assert_eq!(moved, EntryKey::new("E", "x/y/b/c").unwrap());
        assert!(sibling.rebase(&dir, &target).is_none());

        let domain = EntryKey::domain_root("D").unwrap();
        let new_domain = EntryKey::domain_root("F").unwrap();
        let moved = child.rebase(&domain, &new_domain).unwrap().unwrap();
        assert_eq!(moved, EntryKey::new("F", "a/b/c").unwrap());
    }
}
