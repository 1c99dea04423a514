//! The chunking overlay and the pieces it is built from.
//!
//! [`chunker::Chunker`] is the entry point; the other modules hold the
//! naming protocol, the upload stream splitter and the per-operation logic.

pub mod chunker;
pub mod listing;
pub mod naming;
pub mod put;
pub mod reader;
pub mod segmenter;
pub mod transfer;
