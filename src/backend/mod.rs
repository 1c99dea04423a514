//! Contract of the wrapped storage backend.
//!
//! The chunking overlay only talks to storage through [`Backend`]. Optional
//! operations are advertised through [`Features`], read once when the overlay
//! is constructed, so callers check a flag instead of probing the backend.

pub mod local;
pub mod memory;

use crate::{
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::HashType,
        info::SourceInfo,
        object::{BaseObject, DirEntry},
    },
};
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::io::AsyncRead;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Readable body of a stored object.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte window of an object to read. `limit` of `None` reads to the end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    /// Clamp the range to an object of `size` bytes, returning `(start, end)`.
    pub fn clamp(&self, size: u64) -> (u64, u64) {
        let start = self.offset.min(size);
        let end = match self.limit {
            Some(limit) => start.saturating_add(limit).min(size),
            None => size,
        };
        (start, end)
    }
}

/// Optional capabilities of a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Features {
    /// Server-side copy of a single object.
    pub copy: bool,
    /// Server-side rename (move) of a single object.
    pub rename: bool,
    /// Uploads of unknown length.
    pub put_stream: bool,
}

impl Features {
    pub fn all() -> Self {
        Self {
            copy: true,
            rename: true,
            put_stream: true,
        }
    }
}

/// Flat object store the overlay wraps.
///
/// Paths are `/`-separated and relative to the backend root; the root
/// directory is `""`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifies the backend configuration. Server-side copy and move
    /// between overlays is allowed only when both wrap the same identifier.
    fn config_id(&self) -> String;

    fn features(&self) -> Features;

    /// Hash kinds the backend can compute for any stored object.
    fn hashes(&self) -> Vec<HashType>;

    /// List one directory level. Fails with `DirNotFound` for a missing
    /// directory.
    async fn list(&self, dir: &str) -> ChunkerResult<Vec<DirEntry>>;

    /// Describe a single object. Fails with `ObjectNotFound`.
    async fn stat(&self, remote: &str) -> ChunkerResult<BaseObject>;

    async fn open(&self, obj: &BaseObject, range: ByteRange) -> ChunkerResult<BoxReader>;

    /// Store everything `reader` yields under `info.remote()`, replacing any
    /// existing object. `info.size()` of `None` is only passed when
    /// [`Features::put_stream`] is set.
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        info: &dyn SourceInfo,
    ) -> ChunkerResult<BaseObject>;

    async fn remove(&self, obj: &BaseObject) -> ChunkerResult<()>;

    /// Rename `obj` to `remote`, replacing any existing object there.
    async fn rename(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        let _ = (obj, remote);
        Err(ChunkerError::Unsupported("rename"))
    }

    /// Copy `obj` to `remote`, replacing any existing object there.
    async fn copy(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        let _ = (obj, remote);
        Err(ChunkerError::Unsupported("copy"))
    }

    /// Content hash of `obj`, or `None` if the backend can't provide it.
    async fn hash(&self, obj: &BaseObject, kind: HashType) -> ChunkerResult<Option<String>>;

    async fn mkdir(&self, dir: &str) -> ChunkerResult<()> {
        let _ = dir;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> ChunkerResult<()> {
        let _ = dir;
        Ok(())
    }
}

/// Builds a backend rooted at the given path or name.
pub type BackendFactory = Box<dyn Fn(&str) -> ChunkerResult<Arc<dyn Backend>> + Send + Sync>;

/// Backend constructors keyed by name.
///
/// The registry is an ordinary value handed to whatever assembles the
/// runtime; nothing registers itself globally.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `memory` and `local` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |root| {
            Ok(Arc::new(MemoryBackend::new(root)) as Arc<dyn Backend>)
        });
        registry.register("local", |root| {
            Ok(Arc::new(LocalBackend::new(root)) as Arc<dyn Backend>)
        });
        registry
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> ChunkerResult<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str, root: &str) -> ChunkerResult<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ChunkerError::InvalidConfig(format!("unknown backend `{name}`")))?;
        factory(root)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Directory part of a remote path, `""` for the root.
pub fn parent_dir(remote: &str) -> &str {
    let trimmed = remote.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[..pos],
        None => "",
    }
}

/// Join a directory and a name the way listings report remotes.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Basic key validation to avoid trivial path traversal.
///
/// Rejects empty keys, leading `/`, `..` segments and control characters.
pub fn ensure_key_safe(key: &str) -> ChunkerResult<()> {
    let invalid = || ChunkerError::InvalidObjectKey(key.to_string());
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(invalid());
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    Ok(())
}
