use std::fmt;

use sha2::{Digest, Sha256};

use super::{CacheEntry, CacheError};

/// Identity of a cached asset, derived from its source URL.
///
/// Equal URLs always produce equal keys. The key is used both for the
/// in-memory cache and, in its hex rendering, as the value file name in the
/// persistent store.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            f.write_fmt(format_args!("{b:02x}"))?;
        }
        Ok(())
    }
}

impl CacheKey {
    /// Derives the [`CacheKey`] for the given source URL.
    ///
    /// An empty URL is not a loadable source and fails with
    /// [`CacheError::InvalidUrl`].
    pub fn from_url(url: &str) -> CacheEntry<Self> {
        if url.is_empty() {
            return Err(CacheError::InvalidUrl);
        }

        let hash = Sha256::digest(url.as_bytes());
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        Ok(CacheKey { hash })
    }

    /// The file name of this key's value slot in the persistent store:
    /// 64 lowercase hex characters.
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Parses a key back from its hex rendering, as found in the journal and
    /// in value file names.
    pub(super) fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }

        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(CacheKey { hash })
    }
}
