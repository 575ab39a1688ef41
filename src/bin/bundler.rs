//! Burst-aggregating upload client.
//!
//! Reads newline-delimited JSON item descriptors from stdin — a thin stand-in
//! for the external messaging client that feeds the aggregator — and prints
//! one report line per completed or failed burst/singleton:
//!
//! ```text
//! {"burst_key":"g1","path":"/tmp/a.jpg","name":"a.jpg","origin":"chat-1"}
//! ```
//!
//! Items sharing a `burst_key` within the quiet period are bundled into one
//! `.tar.gz` and uploaded as a single file; items without a key upload
//! directly.

use anyhow::Result;
use async_trait::async_trait;
use filedrop::{
    config::BundlerConfig,
    services::burst::{
        BundleError, BurstAggregator, IncomingItem, ItemFetcher, LinkReporter, SourceRef,
    },
    services::upload_client::HttpUploader,
};
use serde::Deserialize;
use std::{path::Path, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// One stdin line.
#[derive(Debug, Deserialize)]
struct ItemSpec {
    burst_key: Option<String>,
    path: String,
    name: String,
    /// Declared size; read from the file when absent.
    size: Option<u64>,
    #[serde(default = "default_origin")]
    origin: String,
}

fn default_origin() -> String {
    "stdin".to_string()
}

/// Fetcher for local-file sources: the `SourceRef` is a filesystem path.
struct FsFetcher;

#[async_trait]
impl ItemFetcher for FsFetcher {
    async fn fetch(&self, source: &SourceRef, dest: &Path) -> Result<(), BundleError> {
        tokio::fs::copy(&source.0, dest)
            .await
            .map_err(|err| BundleError::Fetch {
                name: source.0.clone(),
                reason: err.to_string(),
            })?;
        Ok(())
    }
}

/// Reports outcomes as lines on stdout, one per burst/singleton.
struct StdoutReporter;

#[async_trait]
impl LinkReporter for StdoutReporter {
    async fn report_link(&self, origin: &str, url: &str) {
        println!("{origin}\tlink\t{url}");
    }

    async fn report_failure(&self, origin: &str, message: &str) {
        println!("{origin}\terror\t{message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = BundlerConfig::from_env_and_args()?;
    tracing::info!("Starting bundler with config: {:?}", cfg);

    if !Path::new(&cfg.work_dir).exists() {
        std::fs::create_dir_all(&cfg.work_dir)?;
    }

    let aggregator = BurstAggregator::new(
        Arc::new(FsFetcher),
        Arc::new(HttpUploader::new(cfg.upload_url.clone())),
        Arc::new(StdoutReporter),
        cfg.quiet_period,
        cfg.max_item_bytes,
        cfg.work_dir.clone(),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let spec: ItemSpec = match serde_json::from_str(line) {
            Ok(spec) => spec,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed item line");
                continue;
            }
        };

        let declared_size = match spec.size {
            Some(size) => size,
            None => match tokio::fs::metadata(&spec.path).await {
                Ok(meta) => meta.len(),
                Err(err) => {
                    tracing::warn!(path = %spec.path, error = %err, "skipping unreadable item");
                    continue;
                }
            },
        };

        let item = IncomingItem {
            burst_key: spec.burst_key,
            source: SourceRef(spec.path),
            suggested_name: spec.name,
            declared_size,
        };
        aggregator.ingest(item, &spec.origin).await;
    }

    // stdin closed: let pending bursts settle and finish.
    aggregator.drain().await;
    Ok(())
}
