//! Content hash kinds and the running digest used while chunking.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Hash kinds the overlay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Md5,
    Sha1,
}

impl HashType {
    /// Length of the lowercase hex encoding of a digest of this kind.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => f.write_str("md5"),
            Self::Sha1 => f.write_str("sha1"),
        }
    }
}

/// Running digest over everything a segmenting reader hands downstream.
pub enum Hasher {
    Md5(md5::Context),
    Sha1(Sha1),
}

impl Hasher {
    pub fn new(kind: HashType) -> Self {
        match kind {
            HashType::Md5 => Self::Md5(md5::Context::new()),
            HashType::Sha1 => Self::Sha1(Sha1::new()),
        }
    }

    pub fn kind(&self) -> HashType {
        match self {
            Self::Md5(_) => HashType::Md5,
            Self::Sha1(_) => HashType::Sha1,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha1(ctx) => ctx.update(data),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finish(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha1(ctx) => hex::encode(ctx.finalize()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.kind()).finish()
    }
}

/// One-shot digest of an in-memory buffer.
pub fn digest(kind: HashType, data: &[u8]) -> String {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finish()
}
