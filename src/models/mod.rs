//! Core data models for the chunking overlay.
//!
//! These entities describe objects on the wrapped backend, the composite
//! files presented to callers, and the small metadata object that ties a
//! chunk set together.

pub mod hash;
pub mod info;
pub mod metadata;
pub mod object;
