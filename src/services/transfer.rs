//! Server-side copy and move of whole files.
//!
//! Chunked files are transferred chunk by chunk with the wrapped backend's
//! own copy or move, metadata last. A failed transfer is undone so the
//! destination never ends up half-populated.

use crate::{
    errors::{ChunkerError, ChunkerResult},
    models::{
        hash::HashType,
        info::ObjectInfo,
        metadata::{METADATA_VERSION, MetaInfo, marshal_simple_json},
        object::{BaseObject, CompositeObject},
    },
    services::{
        chunker::Chunker,
        put::{SourceHashes, other_kind},
    },
};
use std::{collections::BTreeSet, fmt, io::Cursor};
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transfer {
    Copy,
    Move,
}

impl Transfer {
    fn refusal(self, remote: &str) -> ChunkerError {
        match self {
            Self::Copy => ChunkerError::CantCopy(remote.to_string()),
            Self::Move => ChunkerError::CantMove(remote.to_string()),
        }
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Copy => "copy",
            Self::Move => "move",
        })
    }
}

impl Chunker {
    /// Copy `src` to `remote` without downloading it.
    ///
    /// Fails with [`ChunkerError::CantCopy`] when the wrapped backend can't
    /// copy or `src` can't be transferred as-is; the caller may fall back to
    /// reading and uploading the data.
    pub async fn copy(&self, src: &CompositeObject, remote: &str) -> ChunkerResult<CompositeObject> {
        if !self.base_features.copy {
            debug!("can't copy `{}`: wrapped backend can't copy", src.remote());
            return Err(Transfer::Copy.refusal(remote));
        }
        self.copy_or_move(src, remote, Transfer::Copy).await
    }

    /// Move `src` to `remote`. Failure semantics as for [`Chunker::copy`].
    pub async fn move_object(
        &self,
        src: &CompositeObject,
        remote: &str,
    ) -> ChunkerResult<CompositeObject> {
        self.copy_or_move(src, remote, Transfer::Move).await
    }

    /// Check that `src` can be transferred verbatim into this overlay and
    /// collect the hash sums its new metadata needs.
    ///
    /// `None` refuses the transfer. Errors reading the source metadata, such
    /// as metadata from a newer version, are returned as is.
    async fn ok_for_server_side(
        &self,
        src: &CompositeObject,
        op: Transfer,
    ) -> ChunkerResult<Option<SourceHashes>> {
        let origin = src.origin();
        let diff = if origin.backend_id != self.identity.backend_id {
            Some("wrapped remotes")
        } else if origin.chunk_size != self.identity.chunk_size {
            Some("chunk sizes")
        } else if origin.name_format != self.identity.name_format {
            Some("chunk name formats")
        } else if origin.start_from != self.identity.start_from {
            Some("chunk numbering")
        } else if origin.meta_format != self.identity.meta_format {
            Some("meta formats")
        } else {
            None
        };
        if let Some(diff) = diff {
            debug!("can't {op} `{}`: different {diff}", src.remote());
            return Ok(None);
        }

        let mut hashes = SourceHashes::default();
        let requires_meta_hash = src.is_composite() && self.use_meta;
        if !requires_meta_hash && !self.hash.all {
            return Ok(Some(hashes));
        }
        let Some(primary) = self.hash.primary else {
            debug!("can't {op} `{}`: no hash to record", src.remote());
            return Ok(None);
        };

        let mut found = self.found_hash(src, primary, &mut hashes).await?;
        if !found && self.hash.fallback {
            found = self.found_hash(src, other_kind(primary), &mut hashes).await?;
        }
        if !found {
            debug!("can't {op} `{}`: hash is not available", src.remote());
            return Ok(None);
        }
        Ok(Some(hashes))
    }

    async fn found_hash(
        &self,
        src: &CompositeObject,
        kind: HashType,
        hashes: &mut SourceHashes,
    ) -> ChunkerResult<bool> {
        match self.hash(src, kind).await? {
            Some(value) if !value.is_empty() => {
                hashes.set(kind, value);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn copy_or_move(
        &self,
        src: &CompositeObject,
        remote: &str,
        op: Transfer,
    ) -> ChunkerResult<CompositeObject> {
        self.forbid_chunk(remote)?;
        let Some(hashes) = self.ok_for_server_side(src, op).await? else {
            return Err(op.refusal(remote));
        };
        // Chunks of whatever lives at the destination now.
        let stale: Vec<BaseObject> = match self.new_object(remote).await {
            Ok(existing) => existing.chunks().cloned().collect(),
            Err(_) => Vec::new(),
        };

        let obj = if src.is_composite() {
            self.transfer_composite(src, remote, op, hashes).await?
        } else {
            let moved = self.transfer_one(op, src.main_chunk()?, remote).await?;
            let mut obj = CompositeObject::from_main(moved, self.identity.clone());
            obj.validate()?;
            obj
        };

        let current: BTreeSet<&str> = obj.chunks().map(|c| c.remote.as_str()).collect();
        for chunk in stale.iter().filter(|c| !current.contains(c.remote.as_str())) {
            if let Err(err) = self.base.remove(chunk).await {
                warn!("failed to remove stale chunk `{}`: {err}", chunk.remote);
            }
        }
        Ok(obj)
    }

    async fn transfer_composite(
        &self,
        src: &CompositeObject,
        remote: &str,
        op: Transfer,
        hashes: SourceHashes,
    ) -> ChunkerResult<CompositeObject> {
        let src_meta = self.read_metadata(src).await?.cloned();

        // (source, destination) pairs transferred so far.
        let mut done: Vec<(BaseObject, BaseObject)> = Vec::new();
        for (chunk_no, chunk) in src.chunks().enumerate() {
            let dest = self.codec.make_chunk_name(remote, chunk_no, None);
            match self.transfer_one(op, chunk, &dest).await {
                Ok(new_chunk) => done.push((chunk.clone(), new_chunk)),
                Err(err) => {
                    self.undo_transfer(op, done).await;
                    return Err(err);
                }
            }
        }
        let chunks: Vec<BaseObject> = done.iter().map(|(_, new)| new.clone()).collect();

        let mut new_main = None;
        if let Some(main) = src.main().filter(|_| self.use_meta) {
            match self.transfer_one(op, main, remote).await {
                Ok(moved) => {
                    done.push((main.clone(), moved.clone()));
                    new_main = Some(moved);
                }
                Err(err) => {
                    self.undo_transfer(op, done).await;
                    return Err(err);
                }
            }
        }

        let Some(new_main) = new_main else {
            // No metadata here: an object at the base name would shadow the chunks.
            if let Ok(existing) = self.base.stat(remote).await {
                if let Err(err) = self.base.remove(&existing).await {
                    warn!("failed to remove `{remote}` shadowing chunks: {err}");
                }
            }
            return CompositeObject::assembled(remote, None, chunks, None, self.identity.clone());
        };

        // Rewrite metadata since native copies may not preserve it verbatim.
        let size: u64 = chunks.iter().map(|c| c.size).sum();
        let md5 = hashes.md5.or_else(|| src_meta.as_ref().and_then(|m| m.md5.clone()));
        let sha1 = hashes.sha1.or_else(|| src_meta.as_ref().and_then(|m| m.sha1.clone()));
        let rewritten = match self
            .rewrite_metadata(remote, &new_main, size, chunks.len(), md5.as_deref(), sha1.as_deref())
            .await
        {
            Ok(rewritten) => rewritten,
            Err(err) => {
                self.undo_transfer(op, done).await;
                return Err(err);
            }
        };

        let meta = MetaInfo {
            version: METADATA_VERSION,
            size,
            chunk_count: chunks.len(),
            md5,
            sha1,
        };
        CompositeObject::assembled(remote, Some(rewritten), chunks, Some(meta), self.identity.clone())
    }

    async fn rewrite_metadata(
        &self,
        remote: &str,
        main: &BaseObject,
        size: u64,
        chunk_count: usize,
        md5: Option<&str>,
        sha1: Option<&str>,
    ) -> ChunkerResult<BaseObject> {
        let data = marshal_simple_json(size, chunk_count, md5, sha1)?;
        let info = ObjectInfo::new(remote, Some(data.len() as u64), main.modified);
        self.base.put(&mut Cursor::new(data), &info).await
    }

    async fn transfer_one(
        &self,
        op: Transfer,
        obj: &BaseObject,
        remote: &str,
    ) -> ChunkerResult<BaseObject> {
        match op {
            Transfer::Copy => self.base.copy(obj, remote).await,
            Transfer::Move => self.server_move(obj, remote).await,
        }
    }

    /// Delete copied objects, or move moved objects back where they were.
    async fn undo_transfer(&self, op: Transfer, done: Vec<(BaseObject, BaseObject)>) {
        for (src, dest) in done.into_iter().rev() {
            let undone = match op {
                Transfer::Copy => self.base.remove(&dest).await,
                Transfer::Move => self.server_move(&dest, &src.remote).await.map(|_| ()),
            };
            if let Err(err) = undone {
                error!("failed to undo {op} of `{}`: {err}", src.remote);
            }
        }
    }
}
