//! Source descriptions handed to the wrapped backend's put.

use crate::models::hash::HashType;
use chrono::{DateTime, Utc};

/// What a put operation knows about the data it is about to receive.
pub trait SourceInfo: Send + Sync {
    /// Destination path relative to the backend root.
    fn remote(&self) -> &str;

    /// Total size in bytes, or `None` for streams of unknown length.
    fn size(&self) -> Option<u64>;

    fn modified(&self) -> DateTime<Utc>;

    /// A precomputed content hash, if the source can supply one.
    fn hash(&self, kind: HashType) -> Option<String>;
}

/// Caller-provided description of a file to upload.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub remote: String,
    pub size: Option<u64>,
    pub modified: DateTime<Utc>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

impl ObjectInfo {
    pub fn new(remote: impl Into<String>, size: Option<u64>, modified: DateTime<Utc>) -> Self {
        Self {
            remote: remote.into(),
            size,
            modified,
            md5: None,
            sha1: None,
        }
    }

    pub fn with_hash(mut self, kind: HashType, value: impl Into<String>) -> Self {
        match kind {
            HashType::Md5 => self.md5 = Some(value.into()),
            HashType::Sha1 => self.sha1 = Some(value.into()),
        }
        self
    }
}

impl SourceInfo for ObjectInfo {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn hash(&self, kind: HashType) -> Option<String> {
        match kind {
            HashType::Md5 => self.md5.clone(),
            HashType::Sha1 => self.sha1.clone(),
        }
    }
}

/// Presents a chunk or metadata upload to the wrapped backend in place of the
/// caller's source, overriding the remote name and size.
pub struct InfoOverlay<'a> {
    src: &'a dyn SourceInfo,
    remote: String,
    size: Option<u64>,
}

impl<'a> InfoOverlay<'a> {
    /// `size` of `None` keeps the size reported by the source.
    pub fn new(src: &'a dyn SourceInfo, remote: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            src,
            remote: remote.into(),
            size,
        }
    }
}

impl SourceInfo for InfoOverlay<'_> {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> Option<u64> {
        self.size.or_else(|| self.src.size())
    }

    fn modified(&self) -> DateTime<Utc> {
        self.src.modified()
    }

    /// Source hashes only describe the whole file, so they are hidden when
    /// this overlay covers a part of it.
    fn hash(&self, kind: HashType) -> Option<String> {
        if self.size() != self.src.size() {
            return None;
        }
        self.src.hash(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_hides_partial_hashes() {
        let src = ObjectInfo::new("fish", Some(250), Utc::now()).with_hash(HashType::Md5, "abc");
        let chunk = InfoOverlay::new(&src, "fish.chunk.001..tmp_0000000001", Some(100));
        assert_eq!(chunk.remote(), "fish.chunk.001..tmp_0000000001");
        assert_eq!(chunk.size(), Some(100));
        assert_eq!(chunk.hash(HashType::Md5), None);
        assert_eq!(chunk.modified(), src.modified);

        let whole = InfoOverlay::new(&src, "fish", None);
        assert_eq!(whole.size(), Some(250));
        assert_eq!(whole.hash(HashType::Md5).as_deref(), Some("abc"));
    }
}
