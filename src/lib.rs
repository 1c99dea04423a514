//! Chunking overlay for object storage.
//!
//! Wraps any [`Backend`] and stores files larger than a configured chunk size
//! as a set of numbered chunk objects plus a small JSON metadata object.
//! Callers see ordinary files: listing, reading, hashing, copying and moving
//! work on whole files regardless of how they are stored.
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunked_store::{Chunker, ChunkerConfig, MemoryBackend};
//!
//! # async fn demo() -> chunked_store::ChunkerResult<()> {
//! let chunker = Chunker::new(Arc::new(MemoryBackend::new("demo")), ChunkerConfig::default())?;
//! let entries = chunker.list("").await?;
//! # let _ = entries;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use backend::{Backend, BackendRegistry, ByteRange, Features, LocalBackend, MemoryBackend};
pub use config::{ChunkerConfig, HashPolicy, MetaFormat};
pub use errors::{ChunkerError, ChunkerResult};
pub use models::{
    hash::HashType,
    info::{ObjectInfo, SourceInfo},
    object::{CompositeObject, Entry},
};
pub use services::chunker::Chunker;
