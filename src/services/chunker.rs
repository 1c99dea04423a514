//! The chunking overlay.
//!
//! [`Chunker`] wraps a [`Backend`] and presents the same flat file contract
//! to callers while transparently splitting large files into chunks. Upload,
//! listing, reading and server-side transfers live in sibling modules as
//! further `impl Chunker` blocks.

use crate::{
    backend::{Backend, BoxReader, ByteRange, Features},
    config::{ChunkerConfig, HashPolicy, MetaFormat},
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::HashType,
        info::{InfoOverlay, SourceInfo},
        metadata::{MetaInfo, unmarshal_simple_json},
        object::{CompositeObject, OverlayIdentity},
    },
    services::{naming::NameCodec, reader::LinearReader},
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};

/// How hash sums are produced and reported, derived from [`HashPolicy`] and
/// the wrapped backend's hash support.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HashSettings {
    /// Hash kind kept in metadata.
    pub primary: Option<HashType>,
    /// Accept the other kind when the source can't supply the primary one.
    pub fallback: bool,
    /// Force metadata on every file because the backend can't hash.
    pub all: bool,
}

impl HashSettings {
    fn resolve(policy: HashPolicy, base_hashes: &[HashType]) -> Self {
        let (primary, fallback, all) = match policy {
            HashPolicy::None => (None, false, false),
            HashPolicy::Md5 => (Some(HashType::Md5), false, false),
            HashPolicy::Sha1 => (Some(HashType::Sha1), false, false),
            HashPolicy::Md5Quick => (Some(HashType::Md5), true, false),
            HashPolicy::Sha1Quick => (Some(HashType::Sha1), true, false),
            HashPolicy::Md5All => (
                Some(HashType::Md5),
                false,
                !base_hashes.contains(&HashType::Md5),
            ),
            HashPolicy::Sha1All => (
                Some(HashType::Sha1),
                false,
                !base_hashes.contains(&HashType::Sha1),
            ),
        };
        Self {
            primary,
            fallback,
            all,
        }
    }
}

/// Chunking overlay over a wrapped backend.
#[derive(Clone)]
pub struct Chunker {
    pub(crate) base: Arc<dyn Backend>,
    pub(crate) config: ChunkerConfig,
    pub(crate) codec: NameCodec,
    pub(crate) base_features: Features,
    pub(crate) base_hashes: Vec<HashType>,
    pub(crate) identity: Arc<OverlayIdentity>,
    pub(crate) use_meta: bool,
    pub(crate) hash: HashSettings,
}

impl Chunker {
    pub fn new(base: Arc<dyn Backend>, config: ChunkerConfig) -> ChunkerResult<Self> {
        config.validate()?;
        let codec = NameCodec::compile(&config.name_format, config.start_from)?;
        let base_features = base.features();
        if !base_features.rename && !base_features.copy {
            return Err(ChunkerError::InvalidConfig(
                "can't use chunker on a backend which doesn't support server-side move or copy"
                    .into(),
            ));
        }
        let base_hashes = base.hashes();
        let hash = HashSettings::resolve(config.hash_type, &base_hashes);
        let identity = Arc::new(OverlayIdentity {
            backend_id: base.config_id(),
            chunk_size: config.chunk_size,
            name_format: config.name_format.clone(),
            start_from: config.start_from,
            meta_format: config.meta_format,
        });
        debug!(
            "chunker over {} with {:?}, hashes {:?}",
            identity.backend_id, config, hash
        );

        Ok(Self {
            use_meta: config.meta_format != MetaFormat::None,
            base,
            config,
            codec,
            base_features,
            base_hashes,
            identity,
            hash,
        })
    }

    pub fn codec(&self) -> &NameCodec {
        &self.codec
    }

    /// Capabilities of the overlay. Move is always available since the
    /// wrapped backend can rename or copy.
    pub fn features(&self) -> Features {
        Features {
            copy: self.base_features.copy,
            rename: true,
            put_stream: self.base_features.put_stream,
        }
    }

    /// Hash kinds reported for files of any size, chunked or not.
    pub fn hashes(&self) -> Vec<HashType> {
        match self.hash.primary {
            Some(kind)
                if !self.hash.fallback && (self.hash.all || self.base_hashes.contains(&kind)) =>
            {
                vec![kind]
            }
            _ => Vec::new(),
        }
    }

    /// Refuse, or complain about, direct mutation of a chunk.
    pub(crate) fn forbid_chunk(&self, path: &str) -> ChunkerResult<()> {
        if let Some(name) = self.codec.parse_chunk_name(path) {
            if self.config.fail_hard {
                return Err(ChunkerError::ChunkOverlap(name.main_name));
            }
            warn!("`{path}` overlaps chunks of `{}`", name.main_name);
        }
        Ok(())
    }

    /// Upload a file of known size.
    pub async fn put<R>(&self, reader: R, info: &dyn SourceInfo) -> ChunkerResult<CompositeObject>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.forbid_chunk(info.remote())?;
        self.guard_existing(info.remote()).await?;
        if info.size().is_none() && !self.base_features.put_stream {
            return Err(ChunkerError::Unsupported("streaming uploads"));
        }
        self.put_chunked(reader, info, info.remote()).await
    }

    /// Upload a stream of unknown length.
    pub async fn put_stream<R>(
        &self,
        reader: R,
        info: &dyn SourceInfo,
    ) -> ChunkerResult<CompositeObject>
    where
        R: AsyncRead + Send + Unpin,
    {
        if !self.base_features.put_stream {
            return Err(ChunkerError::Unsupported("streaming uploads"));
        }
        self.forbid_chunk(info.remote())?;
        self.guard_existing(info.remote()).await?;
        let overlay = StreamInfo(info);
        self.put_chunked(reader, &overlay, info.remote()).await
    }

    /// Replace the content of `obj`. The returned handle describes the new
    /// content; `obj` is stale afterwards.
    pub async fn update<R>(
        &self,
        obj: &CompositeObject,
        reader: R,
        info: &dyn SourceInfo,
    ) -> ChunkerResult<CompositeObject>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.forbid_chunk(obj.remote())?;
        self.read_metadata(obj).await?;
        if info.size().is_none() && !self.base_features.put_stream {
            return Err(ChunkerError::Unsupported("streaming uploads"));
        }
        let overlay = InfoOverlay::new(info, obj.remote(), None);
        self.put_chunked(reader, &overlay, obj.remote()).await
    }

    /// Open a file for reading, optionally restricted to a byte range.
    pub async fn open(&self, obj: &CompositeObject, range: ByteRange) -> ChunkerResult<BoxReader> {
        if !obj.is_composite() {
            return self.base.open(obj.main_chunk()?, range).await;
        }
        self.read_metadata(obj).await?;
        let size = obj.size().ok_or_else(|| {
            ChunkerError::InvariantViolation(format!("`{}` was not validated", obj.remote()))
        })?;
        LinearReader::open(self.base.clone(), obj.chunks().cloned().collect(), range, size).await
    }

    /// Hash of a file, or `None` when it isn't available.
    ///
    /// The wrapped backend is asked first for non-chunked files; metadata is
    /// used for composites and as the fallback.
    pub async fn hash(
        &self,
        obj: &CompositeObject,
        kind: HashType,
    ) -> ChunkerResult<Option<String>> {
        if !obj.is_composite() {
            let main = obj.main_chunk()?;
            match self.base.hash(main, kind).await {
                Ok(Some(value)) if !value.is_empty() => return Ok(Some(value)),
                Ok(_) => {}
                Err(err) => debug!("wrapped hash of `{}` failed: {err}", main.remote),
            }
        }
        let meta = self.read_metadata(obj).await?;
        Ok(meta.and_then(|meta| meta.hash(kind)).map(str::to_owned))
    }

    /// Remove the metadata object and every active data chunk.
    ///
    /// Temporary chunks are left alone since they may belong to an upload
    /// running in parallel. Files with unsupported metadata can still be
    /// removed.
    pub async fn remove(&self, obj: &CompositeObject) -> ChunkerResult<()> {
        self.forbid_chunk(obj.remote())?;
        if let Err(err) = self.read_metadata(obj).await {
            error!("removing `{}` with unsupported metadata: {err}", obj.remote());
        }

        let mut result = match obj.main() {
            Some(main) => self.base.remove(main).await,
            None => Ok(()),
        };
        for chunk in obj.chunks() {
            let removed = self.base.remove(chunk).await;
            if result.is_ok() {
                result = removed;
            }
        }
        result
    }

    pub async fn mkdir(&self, dir: &str) -> ChunkerResult<()> {
        self.forbid_chunk(dir)?;
        self.base.mkdir(dir).await
    }

    pub async fn rmdir(&self, dir: &str) -> ChunkerResult<()> {
        self.base.rmdir(dir).await
    }

    /// Metadata of a composite file, read once and cached in the handle.
    ///
    /// `None` for non-chunked files and when metadata is disabled. Fails for
    /// invalid metadata and for metadata written by a newer version.
    pub async fn read_metadata<'a>(
        &self,
        obj: &'a CompositeObject,
    ) -> ChunkerResult<Option<&'a MetaInfo>> {
        let meta = obj
            .meta_cell()
            .get_or_try_init(|| self.load_metadata(obj))
            .await?;
        Ok(meta.as_ref())
    }

    async fn load_metadata(&self, obj: &CompositeObject) -> ChunkerResult<Option<MetaInfo>> {
        if !obj.is_composite() || !self.use_meta {
            return Ok(None);
        }
        let Some(main) = obj.main() else {
            return Ok(None);
        };

        let mut data = Vec::new();
        self.base
            .open(main, ByteRange::default())
            .await?
            .read_to_end(&mut data)
            .await?;
        let meta = unmarshal_simple_json(&data, true)?;
        if obj.size() != Some(meta.size) || obj.chunk_count() != meta.chunk_count {
            return Err(ChunkerError::InvalidMetadata(format!(
                "metadata of `{}` doesn't match file size",
                obj.remote()
            )));
        }
        Ok(Some(meta))
    }

    /// Fail when overwriting a composite whose metadata can't be trusted.
    async fn guard_existing(&self, remote: &str) -> ChunkerResult<()> {
        if !self.use_meta {
            return Ok(());
        }
        match self.new_object(remote).await {
            Ok(existing) => self.read_metadata(&existing).await.map(|_| ()),
            Err(_) => Ok(()),
        }
    }
}

/// Source description with its size hidden, for streamed uploads.
struct StreamInfo<'a>(&'a dyn SourceInfo);

impl SourceInfo for StreamInfo<'_> {
    fn remote(&self) -> &str {
        self.0.remote()
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn modified(&self) -> chrono::DateTime<chrono::Utc> {
        self.0.modified()
    }

    fn hash(&self, kind: HashType) -> Option<String> {
        self.0.hash(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn config(hash_type: HashPolicy) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: 100,
            name_format: "*.chunk.###".into(),
            hash_type,
            ..ChunkerConfig::default()
        }
    }

    #[test]
    fn test_rejects_backend_without_move() {
        let base = MemoryBackend::new("t").with_features(Features {
            copy: false,
            rename: false,
            put_stream: true,
        });
        assert!(matches!(
            Chunker::new(Arc::new(base), config(HashPolicy::Md5)),
            Err(ChunkerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_advertised_hashes() {
        let md5_only = || Arc::new(MemoryBackend::new("t")) as Arc<dyn Backend>;

        let chunker = Chunker::new(md5_only(), config(HashPolicy::Md5)).unwrap();
        assert_eq!(chunker.hashes(), [HashType::Md5]);

        let chunker = Chunker::new(md5_only(), config(HashPolicy::Sha1)).unwrap();
        assert!(chunker.hashes().is_empty());

        let chunker = Chunker::new(md5_only(), config(HashPolicy::Sha1All)).unwrap();
        assert!(chunker.hash.all);
        assert_eq!(chunker.hashes(), [HashType::Sha1]);

        let chunker = Chunker::new(md5_only(), config(HashPolicy::Md5Quick)).unwrap();
        assert!(chunker.hashes().is_empty());
    }

    #[test]
    fn test_forbid_chunk() {
        let base = Arc::new(MemoryBackend::new("t"));
        let lenient = Chunker::new(base.clone(), config(HashPolicy::Md5)).unwrap();
        lenient.forbid_chunk("fish.chunk.001").unwrap();

        let strict = Chunker::new(
            base,
            ChunkerConfig {
                fail_hard: true,
                ..config(HashPolicy::Md5)
            },
        )
        .unwrap();
        assert!(matches!(
            strict.forbid_chunk("sea/fish.chunk.001"),
            Err(ChunkerError::ChunkOverlap(main)) if main == "sea/fish"
        ));
        strict.forbid_chunk("sea/fish").unwrap();
    }
}
