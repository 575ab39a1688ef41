//! Represents a single retained file in the exchange store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for one stored object.
///
/// The store keeps no index; everything here is derived from the storage
/// directory itself. `id` doubles as the on-disk file name and is the only
/// handle clients ever see.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredObject {
    /// Unique opaque name, generated at store time. Safe as a single
    /// path component.
    pub id: String,

    /// Sanitized client-supplied name, with the random suffix stripped.
    pub original_name: String,

    /// File extension (lowercase, no dot), validated against the
    /// configured allow-list at store time.
    pub extension: String,

    /// Size in bytes, set at store time.
    pub size_bytes: u64,

    /// Timestamp set at store time; immutable for the object's lifetime.
    pub created_at: DateTime<Utc>,
}
