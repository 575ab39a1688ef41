//! Core data models for the ephemeral file exchange.
//!
//! These entities describe the metadata of retained files. They serialize
//! naturally as JSON via `serde`; the actual bytes live on disk only.

pub mod stored_object;
