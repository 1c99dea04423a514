//! Chunking overlay configuration.
//!
//! Values come from code or any serde source; `from_env` overlays
//! `CHUNKER_*` environment variables on the defaults.

use crate::errors::{ChunkerError, ChunkerResult};
use serde::{Deserialize, Serialize};
use std::{env, fmt, str::FromStr};

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_NAME_FORMAT: &str = "*.rclone_chunk.###";
/// Largest accepted first chunk number.
pub const MAX_START_FROM: u64 = u32::MAX as u64;

/// Format of the metadata object kept next to chunked files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaFormat {
    /// No metadata at all. Requires hash type `none`.
    #[serde(rename = "none")]
    None,
    /// Small JSON object with size, chunk count and hashes.
    #[serde(rename = "simplejson")]
    SimpleJson,
}

/// How hash sums of composite files are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// Pass wrapped hashes for non-chunked files, nothing for composites.
    None,
    /// MD5 for composite files.
    Md5,
    /// SHA1 for composite files.
    Sha1,
    /// MD5 for all files, forcing metadata when the backend can't hash.
    Md5All,
    /// SHA1 for all files, forcing metadata when the backend can't hash.
    Sha1All,
    /// Ask the source for MD5, fall back to SHA1 if it has none.
    Md5Quick,
    /// Ask the source for SHA1, fall back to MD5 if it has none.
    Sha1Quick,
}

impl HashPolicy {
    pub fn requires_metadata(self) -> bool {
        self != Self::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Files larger than this are split into chunks.
    pub chunk_size: u64,

    /// Chunk name pattern: one `*` for the base name, a run of `#` for the
    /// zero-padded chunk number.
    pub name_format: String,

    /// Number given to the first chunk. Usually 0 or 1.
    pub start_from: u64,

    pub meta_format: MetaFormat,

    pub hash_type: HashPolicy,

    /// Report files with missing or invalid chunks as errors instead of
    /// skipping them.
    pub fail_hard: bool,

    /// Upload an expected single chunk straight to the base name, saving a
    /// rename. Not transaction safe.
    pub optimize_first_chunk: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            name_format: DEFAULT_NAME_FORMAT.into(),
            start_from: 1,
            meta_format: MetaFormat::SimpleJson,
            hash_type: HashPolicy::Md5,
            fail_hard: false,
            optimize_first_chunk: false,
        }
    }
}

impl ChunkerConfig {
    /// Defaults overridden by `CHUNKER_CHUNK_SIZE`, `CHUNKER_NAME_FORMAT`,
    /// `CHUNKER_START_FROM`, `CHUNKER_META_FORMAT`, `CHUNKER_HASH_TYPE` and
    /// `CHUNKER_FAIL_HARD`.
    pub fn from_env() -> ChunkerResult<Self> {
        let defaults = Self::default();
        let cfg = Self {
            chunk_size: env_or("CHUNKER_CHUNK_SIZE", defaults.chunk_size)?,
            name_format: env_or("CHUNKER_NAME_FORMAT", defaults.name_format)?,
            start_from: env_or("CHUNKER_START_FROM", defaults.start_from)?,
            meta_format: env_or("CHUNKER_META_FORMAT", defaults.meta_format)?,
            hash_type: env_or("CHUNKER_HASH_TYPE", defaults.hash_type)?,
            fail_hard: env_or("CHUNKER_FAIL_HARD", defaults.fail_hard)?,
            optimize_first_chunk: defaults.optimize_first_chunk,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that do not depend on the wrapped backend.
    pub fn validate(&self) -> ChunkerResult<()> {
        if self.chunk_size == 0 {
            return Err(ChunkerError::InvalidConfig(
                "chunk_size must be positive".into(),
            ));
        }
        if self.start_from > MAX_START_FROM {
            return Err(ChunkerError::InvalidConfig(format!(
                "start_from must not exceed {MAX_START_FROM}"
            )));
        }
        if self.hash_type.requires_metadata() && self.meta_format == MetaFormat::None {
            return Err(ChunkerError::InvalidConfig(format!(
                "hash type `{}` requires compatible meta format",
                self.hash_type
            )));
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> ChunkerResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|err| {
            ChunkerError::InvalidConfig(format!("parsing {key} value `{value}`: {err}"))
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(ChunkerError::InvalidConfig(format!("reading {key}: {err}"))),
    }
}

impl FromStr for MetaFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "simplejson" => Ok(Self::SimpleJson),
            other => Err(format!("unsupported meta format `{other}`")),
        }
    }
}

impl fmt::Display for MetaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::SimpleJson => f.write_str("simplejson"),
        }
    }
}

impl FromStr for HashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "md5all" => Ok(Self::Md5All),
            "sha1all" => Ok(Self::Sha1All),
            "md5quick" => Ok(Self::Md5Quick),
            "sha1quick" => Ok(Self::Sha1Quick),
            other => Err(format!("unsupported hash type `{other}`")),
        }
    }
}

impl fmt::Display for HashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Md5All => "md5all",
            Self::Sha1All => "sha1all",
            Self::Md5Quick => "md5quick",
            Self::Sha1Quick => "sha1quick",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ChunkerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.name_format, "*.rclone_chunk.###");
        assert_eq!(cfg.start_from, 1);
    }

    #[test]
    fn test_hash_requires_metadata() {
        let cfg = ChunkerConfig {
            meta_format: MetaFormat::None,
            ..ChunkerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ChunkerError::InvalidConfig(_))
        ));

        let cfg = ChunkerConfig {
            meta_format: MetaFormat::None,
            hash_type: HashPolicy::None,
            ..ChunkerConfig::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn test_start_from_is_bounded() {
        let cfg = ChunkerConfig {
            start_from: MAX_START_FROM,
            ..ChunkerConfig::default()
        };
        cfg.validate().unwrap();

        let cfg = ChunkerConfig {
            start_from: u64::MAX,
            ..ChunkerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ChunkerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: ChunkerConfig = serde_json::from_str(
            r#"{"chunk_size":100,"name_format":"*.chunk.###","hash_type":"sha1quick"}"#,
        )
        .unwrap();
        assert_eq!(cfg.chunk_size, 100);
        assert_eq!(cfg.hash_type, HashPolicy::Sha1Quick);
        assert_eq!(cfg.meta_format, MetaFormat::SimpleJson);
        assert!(!cfg.fail_hard);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("md5all".parse::<HashPolicy>().unwrap(), HashPolicy::Md5All);
        assert!("crc32".parse::<HashPolicy>().is_err());
        assert_eq!("none".parse::<MetaFormat>().unwrap(), MetaFormat::None);
        assert_eq!(HashPolicy::Sha1Quick.to_string(), "sha1quick");
    }
}
