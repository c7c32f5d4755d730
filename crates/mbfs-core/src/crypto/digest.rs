//! SHA-1, the digest fixed by the archive format for storage filenames and
//! content digests.

use ring::digest::{self, Context, SHA1_FOR_LEGACY_USE_ONLY};

/// Length of a SHA-1 digest in bytes.
pub const SHA1_LEN: usize = 20;

pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let hashed = digest::digest(&SHA1_FOR_LEGACY_USE_ONLY, data);
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(hashed.as_ref());
    out
}

/// Lowercase hex SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1(data))
}

/// Incremental SHA-1 over data that arrives in pieces.
pub struct Sha1Stream {
    context: Context,
}

impl Default for Sha1Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Sha1Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha1Stream").finish_non_exhaustive()
    }
}

impl Sha1Stream {
    pub fn new() -> Self {
        Self {
            context: Context::new(&SHA1_FOR_LEGACY_USE_ONLY),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
    }

    pub fn finish(self) -> [u8; SHA1_LEN] {
        let mut out = [0u8; SHA1_LEN];
        out.copy_from_slice(self.context.finish().as_ref());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_known_vectors() {
        assert_eq!(sha1(b""), hex!("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        assert_eq!(sha1(b"abc"), hex!("a9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn test_stream_matches_one_shot() {
        let mut stream = Sha1Stream::new();
        stream.update(b"a");
        stream.update(b"bc");
        assert_eq!(stream.finish(), sha1(b"abc"));
    }

    #[test]
    fn test_hex_is_lowercase() {
        let hex = sha1_hex(b"abc");
        assert_eq!(hex, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(hex.len(), SHA1_LEN * 2);
    }
}
