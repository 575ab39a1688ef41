pub mod burst;
pub mod retention_store;
pub mod upload_client;
