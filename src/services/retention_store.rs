//! src/services/retention_store.rs
//!
//! RetentionStore — the on-disk set of retained objects. It assigns unique
//! names at store time, enforces the extension allow-list and size limit
//! before any bytes become visible, expires objects lazily when they are
//! touched, and removes an object after its first successful download when
//! delete-on-download is configured. There is no database or index: the
//! storage directory itself is the source of truth, and object age is read
//! back from file modification time (stored files are never rewritten after
//! the atomic rename, so mtime is stable).

use crate::models::stored_object::StoredObject;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid file name")]
    InvalidName,
    #[error("file type `{0}` is not allowed")]
    DisallowedType(String),
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("file not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Options controlling a store instance's retention behavior.
#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    /// How long an object survives after it is stored.
    pub retention: Duration,
    /// Remove an object after its first fully delivered download.
    pub delete_on_download: bool,
    /// Maximum accepted object size in bytes.
    pub max_size_bytes: u64,
    /// Lowercase extensions accepted at store time.
    pub allowed_extensions: HashSet<String>,
}

/// RetentionStore owns one storage directory and provides:
/// - `store`: validate, stream to a temp file, atomically rename into place
/// - `resolve` / `open_download`: look up an object, expiring it if stale
/// - `finish_download`: delete-on-download hook, fired after a clean EOF
/// - `list_live` / `delete_one` / `delete_all`: operator surface
/// - `sweep_expired`: the expiry pass, also usable from a background timer
///
/// Every check-then-delete sequence runs under `reap_lock` so that a
/// download racing the sweep (or another download) against the same id
/// deterministically agrees: exactly one side performs the delete and both
/// observe `NotFound` afterward.
#[derive(Clone)]
pub struct RetentionStore {
    /// Directory on disk where object payloads live.
    pub base_path: PathBuf,

    policy: RetentionPolicy,
    reap_lock: Arc<Mutex<()>>,
}

const MAX_STEM_LEN: usize = 64;
const MAX_EXT_LEN: usize = 16;
const ID_SUFFIX_LEN: usize = 8;
const ID_GEN_ATTEMPTS: usize = 16;

// Longest id `store` can generate: stem, '-', suffix, '.', extension.
const MAX_ID_LEN: usize = MAX_STEM_LEN + 1 + ID_SUFFIX_LEN + 1 + MAX_EXT_LEN;

impl RetentionStore {
    pub fn new(base_path: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            base_path: base_path.into(),
            policy,
            reap_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn delete_on_download(&self) -> bool {
        self.policy.delete_on_download
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.policy.max_size_bytes
    }

    /// Reduce a client-declared name to a safe `(stem, extension)` pair.
    ///
    /// Takes the final path component, strips control characters and
    /// filesystem-special characters, and rejects names whose stem or
    /// extension comes out empty. The result is never used as a path on its
    /// own; ids embed it together with a random suffix.
    fn sanitize_name(&self, declared: &str) -> StoreResult<(String, String)> {
        let last = declared
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(declared)
            .trim();

        let cleaned: String = last
            .chars()
            .filter(|c| !c.is_control() && !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|'))
            .map(|c| if c == ' ' { '_' } else { c })
            .collect();
        let cleaned = cleaned.trim_matches('.').trim_matches('_');

        let (stem, ext) = match cleaned.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => return Err(StoreError::InvalidName),
        };
        if stem.is_empty()
            || ext.is_empty()
            || ext.len() > MAX_EXT_LEN
            || !ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(StoreError::InvalidName);
        }

        // Byte-bounded on char boundaries, so every generated id fits the
        // length check `ensure_id_safe` applies on the way back in.
        let mut bounded = String::new();
        for c in stem.chars() {
            if bounded.len() + c.len_utf8() > MAX_STEM_LEN {
                break;
            }
            bounded.push(c);
        }
        Ok((bounded, ext.to_ascii_lowercase()))
    }

    /// Validate an externally supplied id as a safe single path component.
    ///
    /// Rejects separators, traversal, control characters and dot-prefixed
    /// names, so temp files (`.tmp-*`) can never be addressed.
    fn ensure_id_safe(&self, id: &str) -> StoreResult<()> {
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(StoreError::NotFound);
        }
        if id.starts_with('.') || id.contains("..") {
            return Err(StoreError::NotFound);
        }
        if id
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.base_path.join(id)
    }

    /// Store content under a freshly generated unique id.
    ///
    /// The name is sanitized and validated first; the declared length (when
    /// the transport exposes one) and the streamed length are both checked
    /// against the size limit. Bytes go to a `.tmp-*` file which is fsynced
    /// and renamed into place, so a failed store leaves no retrievable
    /// trace.
    pub async fn store<S>(
        &self,
        declared_name: &str,
        declared_len: Option<u64>,
        stream: S,
    ) -> StoreResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let (stem, ext) = self.sanitize_name(declared_name)?;
        if !self.policy.allowed_extensions.contains(&ext) {
            return Err(StoreError::DisallowedType(ext));
        }
        if let Some(len) = declared_len {
            if len > self.policy.max_size_bytes {
                return Err(StoreError::TooLarge {
                    size: len,
                    limit: self.policy.max_size_bytes,
                });
            }
        }

        let tmp_path = self.base_path.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > self.policy.max_size_bytes {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::TooLarge {
                    size: size_bytes,
                    limit: self.policy.max_size_bytes,
                });
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        // Random suffix makes collisions between concurrent stores with the
        // same declared name negligible; regenerate on the off chance.
        let mut chosen_id = None;
        for _ in 0..ID_GEN_ATTEMPTS {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("{}-{}.{}", stem, &suffix[..ID_SUFFIX_LEN], ext);
            if !fs::try_exists(self.object_path(&id)).await? {
                chosen_id = Some(id);
                break;
            }
        }
        let Some(id) = chosen_id else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::AlreadyExists,
                "could not generate a unique object id",
            )));
        };

        let final_path = self.object_path(&id);
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        debug!(id = %id, size_bytes, "stored object");
        Ok(StoredObject {
            id,
            original_name: format!("{}.{}", stem, ext),
            extension: ext,
            size_bytes,
            created_at: Utc::now(),
        })
    }

    /// Look up an object by id, enforcing expiry as a side effect.
    ///
    /// An object past the retention window is removed here and reported as
    /// `NotFound`; the second resolve of the same id is plain `NotFound` as
    /// well, so expiry is lazy and idempotent. "Expired" is never a distinct
    /// outcome for callers.
    pub async fn resolve(&self, id: &str) -> StoreResult<StoredObject> {
        self.ensure_id_safe(id)?;
        let path = self.object_path(id);
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(StoreError::NotFound),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let created_at: DateTime<Utc> = meta.modified()?.into();
        if self.is_expired(created_at) {
            self.remove_object(id).await?;
            return Err(StoreError::NotFound);
        }

        Ok(self.object_from_meta(id, meta.len(), created_at))
    }

    /// Resolve an object and open its payload for streaming.
    pub async fn open_download(&self, id: &str) -> StoreResult<(StoredObject, File)> {
        let object = self.resolve(id).await?;
        let file = File::open(self.object_path(id)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                // Lost a race with a concurrent delete; same outcome as if
                // the object never existed.
                StoreError::NotFound
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok((object, file))
    }

    /// Hook fired after a download stream reached a clean EOF.
    ///
    /// With delete-on-download configured, removes the object. Losing the
    /// race against the sweep or another download is not an error: someone
    /// deleted it, which is the desired end state.
    pub async fn finish_download(&self, id: &str) {
        if !self.policy.delete_on_download {
            return;
        }
        match self.remove_object(id).await {
            Ok(true) => debug!(id = %id, "removed object after download"),
            Ok(false) => debug!(id = %id, "object already gone after download"),
            Err(err) => tracing::warn!(id = %id, error = %err, "delete-on-download failed"),
        }
    }

    /// Sweep the whole directory, removing every expired object.
    ///
    /// Returns the number of objects removed. Called from `list_live` and,
    /// optionally, from a background interval task; correctness never
    /// depends on the timer.
    pub async fn sweep_expired(&self) -> StoreResult<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            let created_at: DateTime<Utc> = meta.modified()?.into();
            if self.is_expired(created_at) && self.remove_object(&name).await? {
                debug!(id = %name, "expired object removed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Sweep, then list metadata for all surviving objects, ordered by id.
    pub async fn list_live(&self) -> StoreResult<Vec<StoredObject>> {
        self.sweep_expired().await?;

        let mut objects = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                // Deleted mid-listing; it simply does not appear.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            let created_at: DateTime<Utc> = meta.modified()?.into();
            objects.push(self.object_from_meta(&name, meta.len(), created_at));
        }
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(objects)
    }

    /// Remove a single object. Idempotent: `Ok(false)` for missing ids.
    pub async fn delete_one(&self, id: &str) -> StoreResult<bool> {
        if self.ensure_id_safe(id).is_err() {
            return Ok(false);
        }
        self.remove_object(id).await
    }

    /// Remove every stored object, returning how many were deleted.
    pub async fn delete_all(&self) -> StoreResult<usize> {
        let _guard = self.reap_lock.lock().await;
        let mut deleted = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        Ok(deleted)
    }

    fn is_expired(&self, created_at: DateTime<Utc>) -> bool {
        let age = Utc::now()
            .signed_duration_since(created_at)
            .to_std()
            .unwrap_or_default();
        age > self.policy.retention
    }

    fn object_from_meta(&self, id: &str, size_bytes: u64, created_at: DateTime<Utc>) -> StoredObject {
        StoredObject {
            id: id.to_string(),
            original_name: derive_original_name(id),
            extension: id
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .unwrap_or_default(),
            size_bytes,
            created_at,
        }
    }

    /// The serialized check-then-delete sequence for a single id.
    ///
    /// `Ok(true)` means this caller performed the delete; `Ok(false)` means
    /// the object was already gone. Concurrent callers never see an error
    /// out of the race itself.
    async fn remove_object(&self, id: &str) -> StoreResult<bool> {
        let _guard = self.reap_lock.lock().await;
        match fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// Strip the random id suffix to recover the sanitized original name.
fn derive_original_name(id: &str) -> String {
    let (stem, ext) = match id.rsplit_once('.') {
        Some(parts) => parts,
        None => return id.to_string(),
    };
    match stem.rsplit_once('-') {
        Some((base, suffix))
            if suffix.len() == ID_SUFFIX_LEN
                && suffix.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            format!("{}.{}", base, ext)
        }
        _ => id.to_string(),
    }
}
