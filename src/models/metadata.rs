//! The `simplejson` metadata object stored next to the chunks of a composite file.
//!
//! Metadata is a tiny JSON document named after the composite file:
//! `{"ver":1,"size":250,"nchunks":3,"md5":"..."}`. It must stay below
//! [`MAX_METADATA_SIZE`] bytes; anything larger is treated as file data, so
//! growing the format requires a version bump rather than a bigger object.

use crate::{
    errors::{ChunkerError, ChunkerResult},
    models::{hash::HashType, object::MAX_SAFE_CHUNK_NUMBER},
};
use serde::{Deserialize, Serialize};

/// Hard ceiling for a valid metadata object.
pub const MAX_METADATA_SIZE: usize = 255;

/// Highest metadata format version this implementation understands.
pub const METADATA_VERSION: i64 = 1;

/// Wire layout. Core fields are optional here so that missing ones can be
/// reported instead of silently defaulted.
#[derive(Serialize, Deserialize, Debug, Default)]
struct SimpleJson {
    #[serde(rename = "ver")]
    version: Option<i64>,
    size: Option<i64>,
    #[serde(rename = "nchunks")]
    chunk_count: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    md5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha1: String,
}

/// Decoded metadata of a composite file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaInfo {
    pub version: i64,
    pub size: u64,
    pub chunk_count: usize,
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

impl MetaInfo {
    pub fn hash(&self, kind: HashType) -> Option<&str> {
        match kind {
            HashType::Md5 => self.md5.as_deref(),
            HashType::Sha1 => self.sha1.as_deref(),
        }
    }
}

/// Encode metadata for a composite file.
pub fn marshal_simple_json(
    size: u64,
    chunk_count: usize,
    md5: Option<&str>,
    sha1: Option<&str>,
) -> ChunkerResult<Vec<u8>> {
    let size = i64::try_from(size)
        .map_err(|_| ChunkerError::InvalidMetadata(format!("size {size} out of range")))?;
    let record = SimpleJson {
        version: Some(METADATA_VERSION),
        size: Some(size),
        chunk_count: Some(chunk_count as i64),
        md5: md5.unwrap_or_default().to_string(),
        sha1: sha1.unwrap_or_default().to_string(),
    };
    let data = serde_json::to_vec(&record)?;
    if data.len() >= MAX_METADATA_SIZE {
        // never produce something we can't consume
        return Err(ChunkerError::InvalidMetadata(format!(
            "encoded metadata is {} bytes",
            data.len()
        )));
    }
    Ok(data)
}

/// Decode and check a metadata object.
///
/// Checks are strict to reduce the chance that a random small file is taken
/// for metadata. With `strict` unset, versions newer than
/// [`METADATA_VERSION`] are accepted; this is only used to detect input that
/// merely looks like metadata.
pub fn unmarshal_simple_json(data: &[u8], strict: bool) -> ChunkerResult<MetaInfo> {
    if data.len() > MAX_METADATA_SIZE {
        return Err(ChunkerError::InvalidMetadata("too big".into()));
    }
    if data.len() < 2 || data[0] != b'{' || data[data.len() - 1] != b'}' {
        return Err(ChunkerError::InvalidMetadata("invalid json".into()));
    }
    let record: SimpleJson = serde_json::from_slice(data)?;

    let (Some(version), Some(size), Some(chunk_count)) =
        (record.version, record.size, record.chunk_count)
    else {
        return Err(ChunkerError::InvalidMetadata(
            "missing required field".into(),
        ));
    };
    if version < 1 {
        return Err(ChunkerError::InvalidMetadata("wrong version".into()));
    }
    if size < 0 {
        return Err(ChunkerError::InvalidMetadata("negative file size".into()));
    }
    if chunk_count < 0 {
        return Err(ChunkerError::InvalidMetadata(
            "negative number of chunks".into(),
        ));
    }
    if chunk_count as u64 > MAX_SAFE_CHUNK_NUMBER as u64 {
        return Err(ChunkerError::ChunkOverflow);
    }
    check_hex(&record.md5, HashType::Md5)?;
    check_hex(&record.sha1, HashType::Sha1)?;
    // zero chunks may become legal in later versions
    if chunk_count < 1 && version <= METADATA_VERSION {
        return Err(ChunkerError::InvalidMetadata(
            "wrong number of chunks".into(),
        ));
    }
    if strict && version > METADATA_VERSION {
        return Err(ChunkerError::MetaVersionUnsupported(version));
    }

    Ok(MetaInfo {
        version,
        size: size as u64,
        chunk_count: chunk_count as usize,
        md5: non_empty(record.md5),
        sha1: non_empty(record.sha1),
    })
}

fn check_hex(value: &str, kind: HashType) -> ChunkerResult<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() != kind.hex_len() || hex::decode(value).is_err() {
        return Err(ChunkerError::InvalidMetadata(format!("wrong {kind} hash")));
    }
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
