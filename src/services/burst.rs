//! src/services/burst.rs
//!
//! BurstAggregator — buffers items that arrive in rapid bursts from an
//! external messaging source, debounces burst completion, bundles a
//! finished burst into one gzip-compressed tar archive, uploads it to the
//! exchange and reports the resulting link back to the burst's originator.
//!
//! One debounce deadline exists per burst key. Each arrival appends the
//! item and rearms the deadline under a single lock, and every armed timer
//! carries the epoch it was armed at; a firing whose epoch is stale
//! (because a later arrival rearmed) is discarded, so a cancelled timer can
//! never also start finalize work. Epochs come from one monotonic counter
//! shared by the whole aggregator, so a timer armed for an earlier burst
//! can never match a later burst that reuses the same key.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, sync::Mutex, time};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque handle to an item's bytes; only the configured `ItemFetcher`
/// knows how to interpret it.
#[derive(Clone, Debug)]
pub struct SourceRef(pub String);

/// One item arriving from the messaging source.
#[derive(Clone, Debug)]
pub struct IncomingItem {
    /// Grouping identifier; items sharing a key belong to one burst.
    /// Absent for singletons, which skip buffering entirely.
    pub burst_key: Option<String>,
    pub source: SourceRef,
    pub suggested_name: String,
    pub declared_size: u64,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("file `{name}` is too large: {size} bytes exceeds the {limit} byte limit")]
    OversizeMember { name: String, size: u64, limit: u64 },
    #[error("failed to fetch `{name}`: {reason}")]
    Fetch { name: String, reason: String },
    #[error("failed to build archive: {0}")]
    Archive(#[from] io::Error),
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Materializes an item's bytes at the given destination path.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceRef, dest: &Path) -> Result<(), BundleError>;
}

/// Sends one file to the exchange, returning its download URL.
#[async_trait]
pub trait ArchiveUploader: Send + Sync {
    async fn upload(&self, path: &Path, file_name: &str) -> Result<String, BundleError>;
}

/// Delivers the single outcome of a burst or singleton to its originator.
#[async_trait]
pub trait LinkReporter: Send + Sync {
    async fn report_link(&self, origin: &str, url: &str);
    async fn report_failure(&self, origin: &str, message: &str);
}

struct Burst {
    members: Vec<IncomingItem>,
    /// Originator of the first member; the whole burst reports there.
    origin: String,
    /// Epoch assigned at the most recent arrival; stale timer firings
    /// compare against it.
    epoch: u64,
}

struct AggregatorInner {
    bursts: Mutex<HashMap<String, Burst>>,
    fetcher: Arc<dyn ItemFetcher>,
    uploader: Arc<dyn ArchiveUploader>,
    reporter: Arc<dyn LinkReporter>,
    quiet_period: Duration,
    max_item_bytes: u64,
    work_dir: PathBuf,
    in_flight: AtomicUsize,
    /// Monotonic source for debounce epochs. Never restarts, even when a
    /// key's burst record is removed and recreated, so a delayed firing
    /// for a finished burst can never match its successor.
    next_epoch: AtomicU64,
}

/// The aggregator instance. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct BurstAggregator {
    inner: Arc<AggregatorInner>,
}

impl BurstAggregator {
    pub fn new(
        fetcher: Arc<dyn ItemFetcher>,
        uploader: Arc<dyn ArchiveUploader>,
        reporter: Arc<dyn LinkReporter>,
        quiet_period: Duration,
        max_item_bytes: u64,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                bursts: Mutex::new(HashMap::new()),
                fetcher,
                uploader,
                reporter,
                quiet_period,
                max_item_bytes,
                work_dir: work_dir.into(),
                in_flight: AtomicUsize::new(0),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Accept one arriving item. Returns immediately; all downstream work
    /// (debounce, fetch, archive, upload, report) runs on spawned tasks so
    /// ingestion of unrelated bursts is never blocked.
    pub async fn ingest(&self, item: IncomingItem, origin: &str) {
        let inner = self.inner.clone();
        match item.burst_key.clone() {
            None => {
                let origin = origin.to_string();
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    inner.process_singleton(item, &origin).await;
                    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Some(key) => {
                let armed_epoch = {
                    let mut bursts = inner.bursts.lock().await;
                    let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let burst = bursts.entry(key.clone()).or_insert_with(|| Burst {
                        members: Vec::new(),
                        origin: origin.to_string(),
                        epoch,
                    });
                    burst.members.push(item);
                    burst.epoch = epoch;
                    epoch
                };
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    time::sleep(inner.quiet_period).await;
                    inner.finalize(&key, armed_epoch).await;
                    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    /// True once no burst is buffered and no spawned work is running.
    pub async fn is_idle(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) == 0
            && self.inner.bursts.lock().await.is_empty()
    }

    /// Wait until every pending burst and spawned task has completed.
    pub async fn drain(&self) {
        while !self.is_idle().await {
            time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl AggregatorInner {
    /// Timer callback: finalize the burst unless a later arrival rearmed.
    async fn finalize(&self, key: &str, armed_epoch: u64) {
        let burst = {
            let mut bursts = self.bursts.lock().await;
            match bursts.get(key) {
                Some(burst) if burst.epoch == armed_epoch => bursts.remove(key),
                _ => None,
            }
        };
        let Some(burst) = burst else {
            debug!(key, armed_epoch, "stale debounce timer discarded");
            return;
        };

        // The burst record is out of the map: nothing can append anymore,
        // and a fresh arrival for the same key starts a new burst.
        debug!(key, members = burst.members.len(), "finalizing burst");
        let outcome = self.bundle_and_upload(key, &burst.members).await;
        match outcome {
            Ok(url) => self.reporter.report_link(&burst.origin, &url).await,
            Err(err) => {
                self.reporter
                    .report_failure(&burst.origin, &err.to_string())
                    .await
            }
        }
    }

    /// Singleton path: no buffering, no debounce, same guarantees.
    async fn process_singleton(&self, item: IncomingItem, origin: &str) {
        let outcome = self.upload_single(&item).await;
        match outcome {
            Ok(url) => self.reporter.report_link(origin, &url).await,
            Err(err) => self.reporter.report_failure(origin, &err.to_string()).await,
        }
    }

    async fn upload_single(&self, item: &IncomingItem) -> Result<String, BundleError> {
        self.check_size(item)?;

        let staging = self
            .work_dir
            .join(format!("single-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging).await?;

        let result = async {
            let dest = staging.join(sanitize_entry_name(&item.suggested_name));
            self.fetcher.fetch(&item.source, &dest).await?;
            self.uploader
                .upload(&dest, &item.suggested_name)
                .await
        }
        .await;

        remove_dir_best_effort(&staging).await;
        result
    }

    /// Validate, materialize, archive and upload one burst's members.
    async fn bundle_and_upload(
        &self,
        key: &str,
        members: &[IncomingItem],
    ) -> Result<String, BundleError> {
        // Every member is validated before any bytes are fetched; one
        // oversize member fails the whole burst with zero uploads.
        for member in members {
            self.check_size(member)?;
        }

        let staging = self
            .work_dir
            .join(format!("burst-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging).await?;
        let archive_name = format!("bundle-{}.tar.gz", &Uuid::new_v4().simple().to_string()[..8]);
        let archive_path = self.work_dir.join(&archive_name);

        let result = self
            .bundle_in(key, members, &staging, &archive_path, &archive_name)
            .await;

        // Cleanup is unconditional and best-effort, success or failure.
        remove_dir_best_effort(&staging).await;
        if let Err(err) = fs::remove_file(&archive_path).await {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %archive_path.display(), error = %err, "leaving archive behind");
            }
        }
        result
    }

    async fn bundle_in(
        &self,
        key: &str,
        members: &[IncomingItem],
        staging: &Path,
        archive_path: &Path,
        archive_name: &str,
    ) -> Result<String, BundleError> {
        let mut entries = Vec::with_capacity(members.len());
        let mut taken = HashSet::new();
        for member in members {
            let entry_name = resolve_entry_name(&member.suggested_name, &mut taken);
            let dest = staging.join(&entry_name);
            self.fetcher.fetch(&member.source, &dest).await?;
            entries.push((entry_name, dest));
        }

        build_archive(archive_path, entries).await?;
        debug!(key, archive = %archive_path.display(), "burst archived");

        self.uploader.upload(archive_path, archive_name).await
    }

    fn check_size(&self, item: &IncomingItem) -> Result<(), BundleError> {
        if item.declared_size > self.max_item_bytes {
            return Err(BundleError::OversizeMember {
                name: item.suggested_name.clone(),
                size: item.declared_size,
                limit: self.max_item_bytes,
            });
        }
        Ok(())
    }
}

/// Write a gzip-compressed tar of `entries` at `archive_path`. Entry names
/// were resolved beforehand; file contents are read from the staged paths.
async fn build_archive(
    archive_path: &Path,
    entries: Vec<(String, PathBuf)>,
) -> Result<(), BundleError> {
    let archive_path = archive_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), BundleError> {
        let file = std::fs::File::create(&archive_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, path) in &entries {
            builder.append_path_with_name(path, name)?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
    .map_err(|err| BundleError::Archive(io::Error::other(err)))?
}

/// Reduce a suggested name to a safe archive entry name.
fn sanitize_entry_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Resolve collisions among suggested names inside one archive by
/// suffixing `-1`, `-2`, ... before the extension. Never overwrites one
/// member with another.
fn resolve_entry_name(suggested: &str, taken: &mut HashSet<String>) -> String {
    let base = sanitize_entry_name(suggested);
    if taken.insert(base.clone()) {
        return base;
    }
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
        None => (base.clone(), None),
    };
    for n in 1.. {
        let candidate = match &ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
    unreachable!()
}

async fn remove_dir_best_effort(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %err, "temp cleanup failed");
        }
    }
}
