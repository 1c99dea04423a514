//! Upload orchestration.
//!
//! Data is uploaded chunk by chunk under temporary names qualified by a
//! transaction id, so concurrent uploads of the same file never collide.
//! Once all data is stored the chunks are renamed to their final names in
//! index order and the metadata object is written last. Any failure removes
//! everything the upload created.

use crate::{
    backend::Backend,
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::{HashType, Hasher},
        info::{InfoOverlay, SourceInfo},
        metadata::{
            MAX_METADATA_SIZE, METADATA_VERSION, MetaInfo, marshal_simple_json,
            unmarshal_simple_json,
        },
        object::{BaseObject, CompositeObject, MAX_SAFE_CHUNK_NUMBER},
    },
    services::{
        chunker::Chunker,
        naming::TransactionId,
        segmenter::SegmentingReader,
    },
};
use std::{io::Cursor, mem, sync::Arc, time::Duration};
use tokio::{io::AsyncRead, runtime::Handle};
use tracing::{debug, error, info, warn};

/// Attempts to find an unused transaction id.
const MAX_TRANSACTION_ATTEMPTS: usize = 100;

/// Upper bound for cleanup after an upload was cancelled.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How [`Chunker::base_move`] treats an existing destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeleteMode {
    /// Delete the destination first.
    Always,
    /// Move, and on failure delete the destination and retry.
    Failed,
}

/// Objects created by one upload, removed again unless committed.
pub(crate) struct Transaction {
    base: Arc<dyn Backend>,
    objects: Vec<BaseObject>,
    settled: bool,
}

impl Transaction {
    fn new(base: Arc<dyn Backend>) -> Self {
        Self {
            base,
            objects: Vec::new(),
            settled: false,
        }
    }

    fn track(&mut self, obj: BaseObject) {
        self.objects.push(obj);
    }

    /// Record that a tracked object now lives under a new name.
    fn renamed(&mut self, old_remote: &str, obj: BaseObject) {
        match self.objects.iter_mut().find(|o| o.remote == old_remote) {
            Some(slot) => *slot = obj,
            None => self.objects.push(obj),
        }
    }

    fn commit(mut self) {
        self.settled = true;
    }

    async fn rollback(mut self) {
        self.settled = true;
        let objects = mem::take(&mut self.objects);
        remove_all(self.base.as_ref(), objects).await;
    }
}

impl Drop for Transaction {
    // The upload future was dropped mid-flight.
    fn drop(&mut self) {
        if self.settled || self.objects.is_empty() {
            return;
        }
        let base = self.base.clone();
        let objects = mem::take(&mut self.objects);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let count = objects.len();
                    let cleanup = remove_all(base.as_ref(), objects);
                    if tokio::time::timeout(ROLLBACK_TIMEOUT, cleanup).await.is_err() {
                        warn!("rollback of {count} cancelled upload chunks timed out");
                    }
                });
            }
            Err(_) => warn!(
                "no runtime to roll back {} temporary chunks",
                objects.len()
            ),
        }
    }
}

async fn remove_all(base: &dyn Backend, objects: Vec<BaseObject>) {
    for obj in objects {
        if let Err(err) = base.remove(&obj).await {
            error!("failed to remove temporary chunk `{}`: {err}", obj.remote);
        }
    }
}

/// Hash sums destined for the metadata object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SourceHashes {
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

impl SourceHashes {
    pub(crate) fn set(&mut self, kind: HashType, value: String) {
        match kind {
            HashType::Md5 => self.md5 = Some(value),
            HashType::Sha1 => self.sha1 = Some(value),
        }
    }
}

pub(crate) fn other_kind(kind: HashType) -> HashType {
    match kind {
        HashType::Md5 => HashType::Sha1,
        HashType::Sha1 => HashType::Md5,
    }
}

impl Chunker {
    /// Upload `input` as the file `remote`, chunking it if needed.
    pub(crate) async fn put_chunked<R>(
        &self,
        input: R,
        src: &dyn SourceInfo,
        remote: &str,
    ) -> ChunkerResult<CompositeObject>
    where
        R: AsyncRead + Send + Unpin,
    {
        let (known, hasher) = self.source_hashes(src);
        let mut seg = SegmentingReader::new(input, self.config.chunk_size, src.size(), hasher);
        let xact_id = self.new_transaction_id(remote).await?;

        let mut tx = Transaction::new(self.base.clone());
        match self.run_put(&mut seg, src, remote, xact_id, known, &mut tx).await {
            Ok(obj) => {
                tx.commit();
                Ok(obj)
            }
            Err(err) => {
                debug!("upload of `{remote}` failed, rolling back: {err}");
                tx.rollback().await;
                Err(err)
            }
        }
    }

    fn source_hashes(&self, src: &dyn SourceInfo) -> (SourceHashes, Option<Hasher>) {
        let mut known = SourceHashes::default();
        let Some(primary) = self.hash.primary else {
            return (known, None);
        };
        if let Some(value) = src.hash(primary).filter(|v| !v.is_empty()) {
            known.set(primary, value);
            return (known, None);
        }
        if self.hash.fallback {
            let alt = other_kind(primary);
            if let Some(value) = src.hash(alt).filter(|v| !v.is_empty()) {
                known.set(alt, value);
            }
            return (known, None);
        }
        (known, Some(Hasher::new(primary)))
    }

    /// Pick a transaction id whose first temporary chunk doesn't exist yet.
    async fn new_transaction_id(&self, remote: &str) -> ChunkerResult<TransactionId> {
        let mut xact_id = TransactionId::from_clock();
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let first_chunk = self.codec.make_chunk_name(remote, 0, Some(xact_id));
            if self.base.stat(&first_chunk).await.is_err() {
                return Ok(xact_id);
            }
            xact_id = xact_id.next();
        }
        Err(ChunkerError::Transaction(remote.to_string()))
    }

    async fn run_put<R>(
        &self,
        seg: &mut SegmentingReader<R>,
        src: &dyn SourceInfo,
        remote: &str,
        xact_id: TransactionId,
        mut hashes: SourceHashes,
        tx: &mut Transaction,
    ) -> ChunkerResult<CompositeObject>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut chunks: Vec<BaseObject> = Vec::new();
        let mut chunk_no = 0usize;

        while !seg.is_done() {
            if chunk_no > MAX_SAFE_CHUNK_NUMBER {
                return Err(ChunkerError::ChunkOverflow);
            }
            seg.start_chunk(chunk_no);
            let temp_remote = self.codec.make_chunk_name(remote, chunk_no, Some(xact_id));
            let size = seg.window_size();
            let saved_read_count = seg.read_count();

            let chunk_remote = if seg.expect_single() && chunk_no == 0 && self.config.optimize_first_chunk {
                remote
            } else {
                temp_remote.as_str()
            };
            let info = InfoOverlay::new(src, chunk_remote, size);
            let mut chunk = self.base.put(&mut *seg, &info).await?;
            tx.track(chunk.clone());

            if let Some(size) = size {
                if size > 0 && seg.read_count() == saved_read_count && seg.expect_single() {
                    // The sink stored the data by hash without reading it.
                    seg.dummy_read(size).await?;
                }
            }
            if seg.size_left() == Some(0) && !seg.is_done() {
                seg.set_done();
            }
            if !seg.is_done() && seg.at_eof().await? {
                seg.set_done();
            }

            if !seg.is_done() && chunk.remote != temp_remote {
                info!("expected single chunk for `{remote}`, got more");
                let moved = self.base_move(&chunk, &temp_remote, DeleteMode::Failed).await?;
                tx.renamed(&chunk.remote, moved.clone());
                chunk = moved;
            }

            let limit = seg.chunk_limit();
            if !(limit == 0 || limit == seg.chunk_size() || seg.size_total().is_none() || seg.is_done()) {
                return Err(ChunkerError::IgnoredBytes(limit));
            }

            chunks.push(chunk);
            chunk_no += 1;
        }

        let read_count = seg.read_count();
        if let Some(expected) = seg.size_total() {
            if read_count != expected {
                return Err(ChunkerError::SizeMismatch {
                    expected,
                    actual: read_count,
                });
            }
        }
        if let Some((kind, value)) = seg.take_hash() {
            hashes.set(kind, value);
        }

        // Input that parses as metadata must never be stored bare, or it
        // would be taken for the metadata of a composite file later on.
        let looks_like_meta = chunks.len() == 1
            && read_count <= MAX_METADATA_SIZE as u64
            && unmarshal_simple_json(seg.small_head(), false).is_ok();
        let keep_chunked =
            chunks.len() > 1 || (self.use_meta && (looks_like_meta || self.hash.all));

        if !keep_chunked {
            self.remove_old_chunks(remote).await;
            let mut chunk = chunks.remove(0);
            if chunk.remote != remote {
                let moved = self.base_move(&chunk, remote, DeleteMode::Always).await?;
                tx.renamed(&chunk.remote, moved.clone());
                chunk = moved;
            }
            return Ok(CompositeObject::from_main(chunk, self.identity.clone()));
        }

        let size_total: u64 = chunks.iter().map(|c| c.size).sum();
        if size_total != read_count {
            return Err(ChunkerError::ChunkSizeMismatch {
                expected: read_count,
                actual: size_total,
            });
        }

        self.remove_old_chunks(remote).await;

        for (chunk_no, chunk) in chunks.iter_mut().enumerate() {
            let final_remote = self.codec.make_chunk_name(remote, chunk_no, None);
            let moved = self.base_move(chunk, &final_remote, DeleteMode::Failed).await?;
            tx.renamed(&chunk.remote, moved.clone());
            *chunk = moved;
        }

        if !self.use_meta {
            if let Ok(stale) = self.base.stat(remote).await {
                debug!("removing stale object `{remote}` shadowing chunks");
                if let Err(err) = self.base.remove(&stale).await {
                    warn!("failed to remove stale object `{remote}`: {err}");
                }
            }
            return CompositeObject::assembled(remote, None, chunks, None, self.identity.clone());
        }

        let metadata = marshal_simple_json(
            size_total,
            chunks.len(),
            hashes.md5.as_deref(),
            hashes.sha1.as_deref(),
        )?;
        let meta_info = InfoOverlay::new(src, remote, Some(metadata.len() as u64));
        let meta_object = self.base.put(&mut Cursor::new(metadata), &meta_info).await?;
        tx.track(meta_object.clone());

        let meta = MetaInfo {
            version: METADATA_VERSION,
            size: size_total,
            chunk_count: chunks.len(),
            md5: hashes.md5,
            sha1: hashes.sha1,
        };
        CompositeObject::assembled(
            remote,
            Some(meta_object),
            chunks,
            Some(meta),
            self.identity.clone(),
        )
    }

    /// Remove the data chunks of the file currently stored at `remote`.
    async fn remove_old_chunks(&self, remote: &str) {
        let Ok(old) = self.new_object(remote).await else {
            return;
        };
        for chunk in old.chunks() {
            if let Err(err) = self.base.remove(chunk).await {
                error!("failed to remove old chunk `{}`: {err}", chunk.remote);
            }
        }
    }

    /// Move a wrapped object, synthesizing the move from copy and delete if
    /// the backend can't rename.
    pub(crate) async fn base_move(
        &self,
        src: &BaseObject,
        remote: &str,
        mode: DeleteMode,
    ) -> ChunkerResult<BaseObject> {
        match mode {
            DeleteMode::Always => self.remove_if_exists(remote).await,
            DeleteMode::Failed => match self.server_move(src, remote).await {
                Ok(moved) => return Ok(moved),
                Err(err) => {
                    debug!("move to `{remote}` failed, retrying after delete: {err}");
                    self.remove_if_exists(remote).await;
                }
            },
        }
        self.server_move(src, remote).await
    }

    pub(crate) async fn server_move(&self, src: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        if self.base_features.rename {
            return self.base.rename(src, remote).await;
        }
        let copied = self.base.copy(src, remote).await?;
        self.base.remove(src).await?;
        Ok(copied)
    }

    pub(crate) async fn remove_if_exists(&self, remote: &str) {
        if let Ok(existing) = self.base.stat(remote).await {
            if let Err(err) = self.base.remove(&existing).await {
                debug!("can't remove `{remote}` before move: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Features, MemoryBackend},
        config::ChunkerConfig,
        models::info::ObjectInfo,
    };
    use chrono::Utc;

    fn chunker(base: Arc<MemoryBackend>, optimize_first_chunk: bool) -> Chunker {
        let config = ChunkerConfig {
            chunk_size: 10,
            name_format: "*.chunk.###".into(),
            optimize_first_chunk,
            ..ChunkerConfig::default()
        };
        Chunker::new(base, config).unwrap()
    }

    #[tokio::test]
    async fn test_single_chunk_stored_bare() {
        let base = Arc::new(MemoryBackend::new("t"));
        for optimize in [false, true] {
            let c = chunker(base.clone(), optimize);
            let info = ObjectInfo::new("fish", Some(5), Utc::now());
            let obj = c.put(&b"hello"[..], &info).await.unwrap();
            assert!(!obj.is_composite());
            assert_eq!(obj.size(), Some(5));
            assert_eq!(base.remotes().await, ["fish"]);
        }
    }

    #[tokio::test]
    async fn test_metadata_lookalike_gets_wrapped() {
        let base = Arc::new(MemoryBackend::new("t"));
        let c = Chunker::new(
            base.clone(),
            ChunkerConfig {
                chunk_size: 1000,
                name_format: "*.chunk.###".into(),
                ..ChunkerConfig::default()
            },
        )
        .unwrap();
        let data = br#"{"ver":1,"size":3,"nchunks":1}"#;
        let info = ObjectInfo::new("trap", Some(data.len() as u64), Utc::now());
        let obj = c.put(&data[..], &info).await.unwrap();
        assert!(obj.is_composite());
        assert_eq!(obj.chunk_count(), 1);
        assert_eq!(base.remotes().await, ["trap", "trap.chunk.001"]);
        assert_eq!(base.read_all("trap.chunk.001").await.unwrap(), &data[..]);
    }

    #[tokio::test]
    async fn test_copy_delete_fallback_for_finalization() {
        let base = Arc::new(MemoryBackend::new("t").with_features(Features {
            copy: true,
            rename: false,
            put_stream: true,
        }));
        let c = chunker(base.clone(), false);
        let info = ObjectInfo::new("fish", Some(25), Utc::now());
        let obj = c.put(&[1u8; 25][..], &info).await.unwrap();
        assert_eq!(obj.chunk_count(), 3);
        assert_eq!(
            base.remotes().await,
            ["fish", "fish.chunk.001", "fish.chunk.002", "fish.chunk.003"]
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_rolls_back() {
        let base = Arc::new(MemoryBackend::new("t"));
        let c = chunker(base.clone(), false);
        let info = ObjectInfo::new("fish", Some(30), Utc::now());
        let err = c.put(&[1u8; 25][..], &info).await.unwrap_err();
        assert!(matches!(
            err,
            ChunkerError::SizeMismatch {
                expected: 30,
                actual: 25
            }
        ));
        assert!(base.remotes().await.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_id_skips_taken_one() {
        let base = Arc::new(MemoryBackend::new("t"));
        let c = chunker(base.clone(), false);
        let first = c.new_transaction_id("fish").await.unwrap();
        assert!(first.value() <= TransactionId::MAX);
        assert_eq!(other_kind(HashType::Md5), HashType::Sha1);
    }
}
