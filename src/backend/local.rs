//! Local disk backend.
//!
//! Objects are plain files beneath `root`, directories are real directories.
//! Uploads are streamed to a hidden temporary file in the destination
//! directory and renamed into place once fully written and synced, so a
//! reader never sees a partially written object.

use crate::{
    backend::{Backend, BoxReader, ByteRange, Features, ensure_key_safe, join_remote},
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::{HashType, Hasher},
        info::SourceInfo,
        object::{BaseObject, DirEntry},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";
const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalBackend {
    /// Base directory holding all objects.
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Physical path of an object or directory. Does not check existence.
    fn path_of(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(remote.split('/').filter(|part| !part.is_empty()));
        path
    }

    async fn describe(&self, remote: &str, path: &Path) -> ChunkerResult<BaseObject> {
        let meta = fs::metadata(path).await.map_err(|err| not_found(err, remote))?;
        if !meta.is_file() {
            return Err(ChunkerError::ObjectNotFound(remote.to_string()));
        }
        let modified = meta.modified().map(DateTime::<Utc>::from)?;
        Ok(BaseObject::new(remote, meta.len(), modified))
    }

    async fn prepare_parent(&self, path: &Path) -> ChunkerResult<PathBuf> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ChunkerError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        Ok(parent)
    }

    /// Stream `reader` into a temporary file next to `path`.
    async fn write_temp(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        path: &Path,
    ) -> ChunkerResult<PathBuf> {
        let parent = self.prepare_parent(path).await?;
        let tmp_path = parent.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let written: io::Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ChunkerError::Io(err));
        }
        Ok(tmp_path)
    }
}

fn not_found(err: io::Error, remote: &str) -> ChunkerError {
    if err.kind() == ErrorKind::NotFound {
        ChunkerError::ObjectNotFound(remote.to_string())
    } else {
        ChunkerError::Io(err)
    }
}

async fn set_modified(path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
    let path = path.to_path_buf();
    let mtime = SystemTime::from(modified);
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_modified(mtime)
    })
    .await
    .map_err(io::Error::other)?
}

#[async_trait]
impl Backend for LocalBackend {
    fn config_id(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn features(&self) -> Features {
        Features::all()
    }

    fn hashes(&self) -> Vec<HashType> {
        vec![HashType::Md5, HashType::Sha1]
    }

    async fn list(&self, dir: &str) -> ChunkerResult<Vec<DirEntry>> {
        if !dir.is_empty() {
            ensure_key_safe(dir)?;
        }
        let path = self.path_of(dir);
        let mut reader = fs::read_dir(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ChunkerError::DirNotFound(dir.to_string())
            } else {
                ChunkerError::Io(err)
            }
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                debug!("skipping non UTF-8 name in {}", path.display());
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let remote = join_remote(dir, &name);
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                entries.push(DirEntry::Dir(remote));
            } else if meta.is_file() {
                let modified = meta.modified().map(DateTime::<Utc>::from)?;
                entries.push(DirEntry::Object(BaseObject::new(remote, meta.len(), modified)));
            }
        }
        entries.sort_by(|a, b| a.remote().cmp(b.remote()));
        Ok(entries)
    }

    async fn stat(&self, remote: &str) -> ChunkerResult<BaseObject> {
        ensure_key_safe(remote)?;
        self.describe(remote, &self.path_of(remote)).await
    }

    async fn open(&self, obj: &BaseObject, range: ByteRange) -> ChunkerResult<BoxReader> {
        ensure_key_safe(&obj.remote)?;
        let path = self.path_of(&obj.remote);
        let mut file = File::open(&path)
            .await
            .map_err(|err| not_found(err, &obj.remote))?;
        let size = file.metadata().await?.len();
        let (start, end) = range.clamp(size);
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(Box::new(file.take(end - start)))
    }

    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        info: &dyn SourceInfo,
    ) -> ChunkerResult<BaseObject> {
        let remote = info.remote();
        ensure_key_safe(remote)?;
        let file_path = self.path_of(remote);
        let tmp_path = self.write_temp(reader, &file_path).await?;

        if let Err(err) = set_modified(&tmp_path, info.modified()).await {
            debug!("failed to set mtime on {}: {}", tmp_path.display(), err);
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ChunkerError::Io(err));
        }
        self.describe(remote, &file_path).await
    }

    async fn remove(&self, obj: &BaseObject) -> ChunkerResult<()> {
        ensure_key_safe(&obj.remote)?;
        let path = self.path_of(&obj.remote);
        fs::remove_file(&path)
            .await
            .map_err(|err| not_found(err, &obj.remote))?;
        debug!("removed physical file {}", path.display());
        Ok(())
    }

    async fn rename(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        ensure_key_safe(&obj.remote)?;
        ensure_key_safe(remote)?;
        let from = self.path_of(&obj.remote);
        let to = self.path_of(remote);
        self.prepare_parent(&to).await?;
        fs::rename(&from, &to)
            .await
            .map_err(|err| not_found(err, &obj.remote))?;
        self.describe(remote, &to).await
    }

    async fn copy(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        ensure_key_safe(&obj.remote)?;
        ensure_key_safe(remote)?;
        let from = self.path_of(&obj.remote);
        let to = self.path_of(remote);
        let mut src = File::open(&from)
            .await
            .map_err(|err| not_found(err, &obj.remote))?;
        let tmp_path = self.write_temp(&mut src, &to).await?;
        if let Err(err) = set_modified(&tmp_path, obj.modified).await {
            debug!("failed to set mtime on {}: {}", tmp_path.display(), err);
        }
        if let Err(err) = fs::rename(&tmp_path, &to).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ChunkerError::Io(err));
        }
        self.describe(remote, &to).await
    }

    async fn hash(&self, obj: &BaseObject, kind: HashType) -> ChunkerResult<Option<String>> {
        ensure_key_safe(&obj.remote)?;
        let mut file = File::open(self.path_of(&obj.remote))
            .await
            .map_err(|err| not_found(err, &obj.remote))?;
        let mut hasher = Hasher::new(kind);
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hasher.finish()))
    }

    async fn mkdir(&self, dir: &str) -> ChunkerResult<()> {
        if dir.is_empty() {
            fs::create_dir_all(&self.root).await?;
            return Ok(());
        }
        ensure_key_safe(dir)?;
        fs::create_dir_all(self.path_of(dir)).await?;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> ChunkerResult<()> {
        if !dir.is_empty() {
            ensure_key_safe(dir)?;
        }
        fs::remove_dir(self.path_of(dir)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ChunkerError::DirNotFound(dir.to_string())
            } else {
                ChunkerError::Io(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::info::ObjectInfo;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_put_stat_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let modified = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
        let info = ObjectInfo::new("sea/fish", Some(5), modified);
        let mut data: &[u8] = b"hello";
        let obj = backend.put(&mut data, &info).await.unwrap();
        assert_eq!(obj.size, 5);
        assert_eq!(obj.modified, modified);

        let root = backend.list("").await.unwrap();
        assert_eq!(root, [DirEntry::Dir("sea".into())]);
        let sea = backend.list("sea").await.unwrap();
        assert_eq!(sea, [DirEntry::Object(obj.clone())]);
        assert_eq!(backend.stat("sea/fish").await.unwrap(), obj);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(matches!(
            backend.list("nowhere").await,
            Err(ChunkerError::DirNotFound(_))
        ));
        assert!(matches!(
            backend.stat("ghost").await,
            Err(ChunkerError::ObjectNotFound(_))
        ));
        assert!(matches!(
            backend.stat("../escape").await,
            Err(ChunkerError::InvalidObjectKey(_))
        ));
        for dir in ["..", "../escape", "sea/../.."] {
            assert!(
                matches!(backend.list(dir).await, Err(ChunkerError::InvalidObjectKey(_))),
                "{dir}"
            );
        }
    }

    #[tokio::test]
    async fn test_range_copy_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let info = ObjectInfo::new("fish", Some(3), Utc::now());
        let mut data: &[u8] = b"abc";
        let obj = backend.put(&mut data, &info).await.unwrap();

        let mut out = Vec::new();
        backend
            .open(&obj, ByteRange::new(1, Some(1)))
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"b");

        let copy = backend.copy(&obj, "deep/fish").await.unwrap();
        assert_eq!(
            backend.hash(&copy, HashType::Sha1).await.unwrap().as_deref(),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        backend.remove(&obj).await.unwrap();
        assert!(matches!(
            backend.remove(&obj).await,
            Err(ChunkerError::ObjectNotFound(_))
        ));
    }
}
