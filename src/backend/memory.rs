//! In-memory backend. Used by tests and as a scratch store.

use crate::{
    backend::{Backend, BoxReader, ByteRange, Features, ensure_key_safe, join_remote},
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::{HashType, digest},
        info::SourceInfo,
        object::{BaseObject, DirEntry},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Cursor},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::RwLock,
};
use tracing::debug;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    modified: DateTime<Utc>,
}

impl StoredObject {
    fn describe(&self, remote: &str) -> BaseObject {
        BaseObject::new(remote, self.data.len() as u64, self.modified)
    }
}

#[derive(Default, Debug)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    dirs: BTreeSet<String>,
}

impl State {
    fn dir_exists(&self, dir: &str) -> bool {
        if dir.is_empty() || self.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{dir}/");
        self.objects.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn fetch(&self, remote: &str) -> ChunkerResult<&StoredObject> {
        self.objects
            .get(remote)
            .ok_or_else(|| ChunkerError::ObjectNotFound(remote.to_string()))
    }
}

/// Objects kept in a sorted map; directories are implied by object paths or
/// created explicitly with `mkdir`.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    features: Features,
    hashes: Vec<HashType>,
    state: RwLock<State>,
}

impl MemoryBackend {
    /// All features enabled, MD5 hashing only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Features::all(),
            hashes: vec![HashType::Md5],
            state: RwLock::new(State::default()),
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_hashes(mut self, hashes: Vec<HashType>) -> Self {
        self.hashes = hashes;
        self
    }

    /// Every stored object path, sorted.
    pub async fn remotes(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    /// Raw content of a stored object.
    pub async fn read_all(&self, remote: &str) -> ChunkerResult<Bytes> {
        Ok(self.state.read().await.fetch(remote)?.data.clone())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn config_id(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn features(&self) -> Features {
        self.features
    }

    fn hashes(&self) -> Vec<HashType> {
        self.hashes.clone()
    }

    async fn list(&self, dir: &str) -> ChunkerResult<Vec<DirEntry>> {
        let state = self.state.read().await;
        if !state.dir_exists(dir) {
            return Err(ChunkerError::DirNotFound(dir.to_string()));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        let mut entries = Vec::new();
        let mut subdirs = BTreeSet::new();
        for (remote, obj) in state.objects.range(prefix.clone()..) {
            let Some(rest) = remote.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    subdirs.insert(join_remote(dir, sub));
                }
                None => entries.push(DirEntry::Object(obj.describe(remote))),
            }
        }
        for explicit in state.dirs.range(prefix.clone()..) {
            let Some(rest) = explicit.strip_prefix(&prefix) else {
                break;
            };
            let sub = rest.split('/').next().unwrap_or(rest);
            if !sub.is_empty() {
                subdirs.insert(join_remote(dir, sub));
            }
        }
        entries.extend(subdirs.into_iter().map(DirEntry::Dir));
        Ok(entries)
    }

    async fn stat(&self, remote: &str) -> ChunkerResult<BaseObject> {
        Ok(self.state.read().await.fetch(remote)?.describe(remote))
    }

    async fn open(&self, obj: &BaseObject, range: ByteRange) -> ChunkerResult<BoxReader> {
        let data = self.state.read().await.fetch(&obj.remote)?.data.clone();
        let (start, end) = range.clamp(data.len() as u64);
        Ok(Box::new(Cursor::new(data.slice(start as usize..end as usize))))
    }

    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        info: &dyn SourceInfo,
    ) -> ChunkerResult<BaseObject> {
        let remote = info.remote();
        ensure_key_safe(remote)?;
        if info.size().is_none() && !self.features.put_stream {
            return Err(ChunkerError::Unsupported("streaming uploads"));
        }
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;

        let stored = StoredObject {
            data: Bytes::from(buf),
            modified: info.modified(),
        };
        let obj = stored.describe(remote);
        self.state
            .write()
            .await
            .objects
            .insert(remote.to_string(), stored);
        debug!("stored {} bytes at {}", obj.size, remote);
        Ok(obj)
    }

    async fn remove(&self, obj: &BaseObject) -> ChunkerResult<()> {
        self.state
            .write()
            .await
            .objects
            .remove(&obj.remote)
            .map(|_| ())
            .ok_or_else(|| ChunkerError::ObjectNotFound(obj.remote.clone()))
    }

    async fn rename(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        if !self.features.rename {
            return Err(ChunkerError::Unsupported("rename"));
        }
        ensure_key_safe(remote)?;
        let mut state = self.state.write().await;
        let stored = state
            .objects
            .remove(&obj.remote)
            .ok_or_else(|| ChunkerError::ObjectNotFound(obj.remote.clone()))?;
        let moved = stored.describe(remote);
        state.objects.insert(remote.to_string(), stored);
        Ok(moved)
    }

    async fn copy(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        if !self.features.copy {
            return Err(ChunkerError::Unsupported("copy"));
        }
        ensure_key_safe(remote)?;
        let mut state = self.state.write().await;
        let stored = state.fetch(&obj.remote)?.clone();
        let copied = stored.describe(remote);
        state.objects.insert(remote.to_string(), stored);
        Ok(copied)
    }

    async fn hash(&self, obj: &BaseObject, kind: HashType) -> ChunkerResult<Option<String>> {
        if !self.hashes.contains(&kind) {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(Some(digest(kind, &state.fetch(&obj.remote)?.data)))
    }

    async fn mkdir(&self, dir: &str) -> ChunkerResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        ensure_key_safe(dir)?;
        self.state.write().await.dirs.insert(dir.to_string());
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> ChunkerResult<()> {
        let mut state = self.state.write().await;
        if !state.dir_exists(dir) {
            return Err(ChunkerError::DirNotFound(dir.to_string()));
        }
        let prefix = format!("{dir}/");
        let busy = state.objects.keys().any(|k| k.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix));
        if busy {
            return Err(ChunkerError::Io(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory `{dir}` is not empty"),
            )));
        }
        state.dirs.remove(dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::info::ObjectInfo;

    async fn put(backend: &MemoryBackend, remote: &str, data: &[u8]) -> BaseObject {
        let info = ObjectInfo::new(remote, Some(data.len() as u64), Utc::now());
        let mut reader = data;
        backend.put(&mut reader, &info).await.unwrap()
    }

    #[tokio::test]
    async fn test_list_one_level() {
        let backend = MemoryBackend::new("t");
        put(&backend, "a", b"1").await;
        put(&backend, "sea/fish", b"22").await;
        put(&backend, "sea/deep/whale", b"333").await;
        backend.mkdir("empty").await.unwrap();

        let root = backend.list("").await.unwrap();
        let names: Vec<_> = root.iter().map(DirEntry::remote).collect();
        assert_eq!(names, ["a", "empty", "sea"]);

        let sea = backend.list("sea").await.unwrap();
        assert!(matches!(&sea[0], DirEntry::Object(o) if o.remote == "sea/fish" && o.size == 2));
        assert!(matches!(&sea[1], DirEntry::Dir(d) if d == "sea/deep"));

        assert!(matches!(
            backend.list("nowhere").await,
            Err(ChunkerError::DirNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_range_and_rename() {
        let backend = MemoryBackend::new("t");
        let obj = put(&backend, "fish", b"0123456789").await;

        let mut out = String::new();
        backend
            .open(&obj, ByteRange::new(3, Some(4)))
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "3456");

        let moved = backend.rename(&obj, "sea/fish").await.unwrap();
        assert_eq!(moved.size, 10);
        assert_eq!(backend.remotes().await, ["sea/fish"]);
        assert!(matches!(
            backend.stat("fish").await,
            Err(ChunkerError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hash_support() {
        let backend = MemoryBackend::new("t");
        let obj = put(&backend, "fish", b"abc").await;
        assert_eq!(
            backend.hash(&obj, HashType::Md5).await.unwrap().as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert_eq!(backend.hash(&obj, HashType::Sha1).await.unwrap(), None);
    }
}
