//! Chunk naming protocol.
//!
//! A pattern such as `*.chunk.###` names data chunks after their composite
//! file: `*` stands for the file name and the run of `#` for the zero-padded
//! chunk number. Chunks written by an unfinished upload carry a temporary
//! suffix `..tmp_<transaction>` and are invisible in listings.
//!
//! Control chunks (`_` followed by a short lowercase type in place of the
//! number) are reserved; they are recognized so that listings can skip them.

use crate::{
    config::MAX_START_FROM,
    errors::{ChunkerError, ChunkerResult},
};
use chrono::Utc;
use regex::Regex;
use std::fmt;
use tracing::info;

const TEMP_SUFFIX: &str = "..tmp_";
const TEMP_SUFFIX_RE: &str = r"(?:\.\.tmp_([0-9]{10,13}))?";
const CTRL_TYPE_RE: &str = "[a-z][a-z0-9]{2,6}";

/// Identifier qualifying the temporary chunk names of one upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Largest identifier that still fits the 13-digit suffix.
    pub const MAX: u64 = 9_999_999_999_999;

    pub fn new(value: u64) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    /// Derived from the current time in milliseconds.
    pub fn from_clock() -> Self {
        let millis = Utc::now().timestamp_millis().unsigned_abs();
        Self(millis % (Self::MAX + 1))
    }

    /// The following identifier, wrapping around at [`Self::MAX`].
    pub fn next(self) -> Self {
        if self.0 >= Self::MAX {
            Self(0)
        } else {
            Self(self.0 + 1)
        }
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

/// What the numbered position of a chunk name holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Zero-based data chunk index.
    Data(usize),
    /// Reserved control chunk type.
    Control(String),
}

/// Parsed view of a chunk name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkName {
    /// Path of the composite file owning the chunk.
    pub main_name: String,
    pub kind: ChunkKind,
    /// Set for chunks of an unfinished upload.
    pub xact_id: Option<TransactionId>,
}

impl ChunkName {
    pub fn is_temporary(&self) -> bool {
        self.xact_id.is_some()
    }

    pub fn data_index(&self) -> Option<usize> {
        match self.kind {
            ChunkKind::Data(index) => Some(index),
            ChunkKind::Control(_) => None,
        }
    }
}

/// Compiled chunk name pattern: generator and recognizer.
#[derive(Clone, Debug)]
pub struct NameCodec {
    prefix: String,
    infix: String,
    suffix: String,
    digits: usize,
    start_from: u64,
    recognizer: Regex,
}

impl NameCodec {
    pub fn compile(pattern: &str, start_from: u64) -> ChunkerResult<Self> {
        let invalid = |reason: &str| ChunkerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if start_from > MAX_START_FROM {
            return Err(invalid("first chunk number is too large"));
        }
        if pattern.matches('*').count() != 1 {
            return Err(invalid("pattern must have exactly one asterisk (*)"));
        }
        let (Some(first_hash), Some(last_hash)) = (pattern.find('#'), pattern.rfind('#')) else {
            return Err(invalid("pattern must have a hash character (#)"));
        };
        let star = pattern.find('*').unwrap_or_default();
        if star > first_hash {
            return Err(invalid("asterisk (*) in pattern must come before hashes (#)"));
        }
        if pattern[first_hash..=last_hash].bytes().any(|b| b != b'#') {
            return Err(invalid("hashes (#) in pattern must be consecutive"));
        }
        if pattern.contains('/') {
            return Err(invalid("directory separator prohibited"));
        }

        let prefix = &pattern[..star];
        let infix = &pattern[star + 1..first_hash];
        let suffix = &pattern[last_hash + 1..];
        let digits = last_hash + 1 - first_hash;

        // The base capture is non-greedy so it can't swallow the temporary
        // suffix, and anchored so a chunk-like base is recovered whole.
        let expr = format!(
            "^{}(.+?){}(?:([0-9]{{{digits},}})|_({CTRL_TYPE_RE})){}{TEMP_SUFFIX_RE}$",
            regex::escape(prefix),
            regex::escape(infix),
            regex::escape(suffix),
        );
        let recognizer = Regex::new(&expr).map_err(|err| invalid(&err.to_string()))?;

        Ok(Self {
            prefix: prefix.to_string(),
            infix: infix.to_string(),
            suffix: suffix.to_string(),
            digits,
            start_from,
            recognizer,
        })
    }

    /// Name of data chunk `chunk_no` (zero based) of `path`.
    ///
    /// Only the last path component is rewritten. A transaction id yields
    /// a temporary name.
    pub fn make_chunk_name(
        &self,
        path: &str,
        chunk_no: usize,
        xact_id: Option<TransactionId>,
    ) -> String {
        let (dir, name) = split_path(path);
        let number = (chunk_no as u64).saturating_add(self.start_from);
        let mut chunk = format!(
            "{dir}{}{name}{}{number:0width$}{}",
            self.prefix,
            self.infix,
            self.suffix,
            width = self.digits
        );
        if let Some(xact_id) = xact_id {
            chunk.push_str(TEMP_SUFFIX);
            chunk.push_str(&xact_id.to_string());
        }
        chunk
    }

    /// Recognize a chunk name, or `None` if `path` is an ordinary file.
    pub fn parse_chunk_name(&self, path: &str) -> Option<ChunkName> {
        let (dir, name) = split_path(path);
        let caps = self.recognizer.captures(name)?;
        let base = caps.get(1)?.as_str();

        let kind = match (caps.get(2), caps.get(3)) {
            (Some(digits), _) => {
                let number: u64 = digits.as_str().parse().ok()?;
                let Some(index) = number.checked_sub(self.start_from) else {
                    info!("invalid data chunk number in file {name:?}");
                    return None;
                };
                ChunkKind::Data(usize::try_from(index).ok()?)
            }
            (None, Some(ctrl)) => ChunkKind::Control(ctrl.as_str().to_string()),
            (None, None) => return None,
        };

        let xact_id = match caps.get(4) {
            Some(m) => Some(TransactionId::new(m.as_str().parse().ok()?)?),
            None => None,
        };

        Some(ChunkName {
            main_name: format!("{dir}{base}"),
            kind,
            xact_id,
        })
    }

    pub fn is_chunk(&self, path: &str) -> bool {
        self.parse_chunk_name(path).is_some()
    }
}

/// Split into the directory part, including its trailing `/`, and the name.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => path.split_at(pos + 1),
        None => ("", path),
    }
}
