//! Ephemeral file exchange: clients upload a file, receive a single-use
//! download link, and the file is reclaimed after a retention window or
//! immediately after its first download. The `burst` service implements the
//! companion aggregation client that bundles rapid-fire item groups into
//! one archive before uploading.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
