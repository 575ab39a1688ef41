use crate::services::retention_store::RetentionStore;

pub mod exchange_handlers;
pub mod health_handlers;

/// Shared state carried by the router to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: RetentionStore,
    pub admin_token: String,
    /// Overrides the request Host header when building download links.
    pub public_base_url: Option<String>,
}
