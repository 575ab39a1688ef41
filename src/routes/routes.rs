//! Defines routes for the exchange and its operator surface.
//!
//! ## Structure
//! - **Public endpoints**
//!   - `POST /upload`      — multipart upload, responds with a download link
//!   - `GET  /files/{id}`  — streams the file; 404 once gone or expired
//!
//! - **Operator endpoints** (shared-token gated)
//!   - `GET    /admin/files`      — sweep + list all live files
//!   - `DELETE /admin/files/{id}` — delete one file
//!   - `DELETE /admin/files`      — delete everything
//!
//! The router carries shared state (`AppState`) to all handlers.

use crate::handlers::{
    AppState,
    exchange_handlers::{
        delete_all_files, delete_file, download_file, home, list_files, upload_file,
    },
    health_handlers::{healthz, readyz},
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build and return the router for all exchange routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/", get(home))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // public exchange surface
        .route("/upload", post(upload_file))
        .route("/files/{id}", get(download_file))
        // operator surface
        .route("/admin/files", get(list_files).delete(delete_all_files))
        .route("/admin/files/{id}", delete(delete_file))
}
