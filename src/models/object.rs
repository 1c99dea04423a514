//! Represents objects as seen on the wrapped backend and as presented to callers.

use crate::{
    errors::{ChunkerError, ChunkerResult},
    models::metadata::{MAX_METADATA_SIZE, MetaInfo},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Refuse to track chunk indices beyond this, whatever a crafted name says.
pub const MAX_SAFE_CHUNK_NUMBER: usize = 10_000_000;

/// A single object stored on the wrapped backend.
///
/// This is a snapshot: it records what the backend reported when the object
/// was listed, stat'ed or written, and carries no connection to the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BaseObject {
    /// Path of the object relative to the backend root.
    pub remote: String,

    /// Size in bytes.
    pub size: u64,

    /// Modification time.
    pub modified: DateTime<Utc>,
}

impl BaseObject {
    pub fn new(remote: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            remote: remote.into(),
            size,
            modified,
        }
    }
}

/// A flat directory entry returned by a wrapped backend listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirEntry {
    Object(BaseObject),
    Dir(String),
}

impl DirEntry {
    pub fn remote(&self) -> &str {
        match self {
            Self::Object(obj) => &obj.remote,
            Self::Dir(remote) => remote,
        }
    }
}

/// Parameters that must match between source and destination for server-side
/// copy and move of chunk sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayIdentity {
    pub backend_id: String,
    pub chunk_size: u64,
    pub name_format: String,
    pub start_from: u64,
    pub meta_format: crate::config::MetaFormat,
}

/// The logical file presented to callers of the overlay.
///
/// Either a single pass-through object (`chunks` empty, `main` holds the
/// wrapped file) or a chunked file whose `main` is the metadata object (absent
/// when metadata is disabled) and whose `chunks` hold one reference per index.
///
/// Handles are immutable snapshots. Operations that change the file return a
/// new handle and leave earlier handles stale.
#[derive(Clone, Debug)]
pub struct CompositeObject {
    remote: String,
    main: Option<BaseObject>,
    chunks: Vec<Option<BaseObject>>,
    size: Option<u64>,
    meta: OnceCell<Option<MetaInfo>>,
    origin: Arc<OverlayIdentity>,
}

impl CompositeObject {
    /// Wrap a non-chunked object, or the metadata object of a composite
    /// that still has to receive its chunks.
    pub(crate) fn from_main(main: BaseObject, origin: Arc<OverlayIdentity>) -> Self {
        Self {
            remote: main.remote.clone(),
            size: Some(main.size),
            main: Some(main),
            chunks: Vec::new(),
            meta: OnceCell::new(),
            origin,
        }
    }

    /// An empty composite without metadata, filled by `add_chunk`.
    pub(crate) fn headless(remote: impl Into<String>, origin: Arc<OverlayIdentity>) -> Self {
        Self {
            remote: remote.into(),
            main: None,
            chunks: Vec::new(),
            size: None,
            meta: OnceCell::new(),
            origin,
        }
    }

    /// A freshly written composite whose metadata is already known.
    pub(crate) fn assembled(
        remote: impl Into<String>,
        main: Option<BaseObject>,
        chunks: Vec<BaseObject>,
        meta: Option<MetaInfo>,
        origin: Arc<OverlayIdentity>,
    ) -> ChunkerResult<Self> {
        let mut obj = Self {
            remote: remote.into(),
            main,
            chunks: chunks.into_iter().map(Some).collect(),
            size: None,
            meta: OnceCell::new(),
            origin,
        };
        obj.validate()?;
        if obj.main.is_none() || meta.is_some() {
            let _ = obj.meta.set(meta);
        }
        Ok(obj)
    }

    /// Place a chunk at its index, leaving holes for indices not seen yet.
    pub(crate) fn add_chunk(&mut self, chunk: BaseObject, chunk_no: usize) -> ChunkerResult<()> {
        if chunk_no == self.chunks.len() {
            self.chunks.push(Some(chunk));
            return Ok(());
        }
        if chunk_no > MAX_SAFE_CHUNK_NUMBER {
            return Err(ChunkerError::ChunkOverflow);
        }
        if chunk_no > self.chunks.len() {
            self.chunks.resize(chunk_no + 1, None);
        }
        self.chunks[chunk_no] = Some(chunk);
        Ok(())
    }

    /// Verify the object internals and cache the total data size.
    pub fn validate(&mut self) -> ChunkerResult<()> {
        if !self.is_composite() {
            let size = self.main_chunk()?.size;
            self.size = Some(size);
            return Ok(());
        }

        if let Some(meta) = &self.main {
            if meta.size > MAX_METADATA_SIZE as u64 {
                self.size = None;
                return Err(ChunkerError::invalid_composite(
                    &self.remote,
                    "metadata is too large",
                ));
            }
        }

        let mut total = 0u64;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            match chunk {
                Some(chunk) => total += chunk.size,
                None => {
                    self.size = None;
                    return Err(ChunkerError::invalid_composite(
                        &self.remote,
                        format!("missing chunk {idx}"),
                    ));
                }
            }
        }
        self.size = Some(total);
        Ok(())
    }

    /// The metadata object for chunked files with metadata, the first chunk
    /// for chunked files without it, or the wrapped file for non-chunked ones.
    pub fn main_chunk(&self) -> ChunkerResult<&BaseObject> {
        if let Some(main) = &self.main {
            return Ok(main);
        }
        match self.chunks.first() {
            Some(Some(first)) => Ok(first),
            _ => Err(ChunkerError::InvariantViolation(format!(
                "composite `{}` has neither metadata nor chunks",
                self.remote
            ))),
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Total data size, known once `validate` has succeeded.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn modified(&self) -> ChunkerResult<DateTime<Utc>> {
        Ok(self.main_chunk()?.modified)
    }

    /// Metadata object of a chunked file, or the wrapped non-chunked file.
    pub fn main(&self) -> Option<&BaseObject> {
        self.main.as_ref()
    }

    /// Data chunks in index order. Empty for non-chunked files.
    pub fn chunks(&self) -> impl Iterator<Item = &BaseObject> {
        self.chunks.iter().flatten()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn origin(&self) -> &Arc<OverlayIdentity> {
        &self.origin
    }

    pub(crate) fn meta_cell(&self) -> &OnceCell<Option<MetaInfo>> {
        &self.meta
    }

    /// Whether the metadata object has been read and checked.
    pub fn is_full(&self) -> bool {
        self.meta.initialized()
    }
}

/// An entry of an overlay listing.
#[derive(Clone, Debug)]
pub enum Entry {
    Object(CompositeObject),
    Dir(String),
}

impl Entry {
    pub fn remote(&self) -> &str {
        match self {
            Self::Object(obj) => obj.remote(),
            Self::Dir(remote) => remote,
        }
    }
}
