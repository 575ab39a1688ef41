use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::HashSet, env, time::Duration};

/// Centralized exchange-server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub retention: Duration,
    pub delete_on_download: bool,
    pub max_upload_bytes: u64,
    pub allowed_extensions: HashSet<String>,
    pub admin_token: String,
    pub public_base_url: Option<String>,
    pub sweep_interval: Option<Duration>,
}

const DEFAULT_ALLOWED_EXTENSIONS: &str =
    "zip,gz,tgz,tar,pdf,png,jpg,jpeg,gif,mp4,mp3,txt,doc,docx,xls,xlsx,csv";

/// Command-line + environment configuration for the exchange server.
#[derive(Parser, Debug)]
#[command(author, version, about = "Ephemeral file exchange server")]
pub struct Args {
    /// Host to bind to (overrides FILEDROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILEDROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where files are stored (overrides FILEDROP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Retention window in seconds (overrides FILEDROP_RETENTION_SECS)
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Remove a file after its first successful download
    /// (overrides FILEDROP_DELETE_ON_DOWNLOAD)
    #[arg(long)]
    pub delete_on_download: bool,

    /// Maximum upload size in bytes (overrides FILEDROP_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Comma-separated extension allow-list (overrides FILEDROP_ALLOWED_EXTENSIONS)
    #[arg(long)]
    pub allowed_extensions: Option<String>,

    /// Shared secret for the operator endpoints (overrides FILEDROP_ADMIN_TOKEN)
    #[arg(long)]
    pub admin_token: Option<String>,

    /// Base URL used when building download links, e.g. https://files.example.com
    /// (overrides FILEDROP_PUBLIC_BASE_URL; defaults to the request Host header)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run a background expiry sweep every N seconds
    /// (overrides FILEDROP_SWEEP_INTERVAL_SECS; lazy sweep remains authoritative)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::from_env_and(args)
    }

    pub fn from_env_and(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("FILEDROP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env_u64("FILEDROP_PORT", 10_000)? as u16;
        let env_storage = env::var("FILEDROP_STORAGE_DIR").unwrap_or_else(|_| "./uploads".into());
        let env_retention = parse_env_u64("FILEDROP_RETENTION_SECS", 86_400)?;
        let env_delete = env::var("FILEDROP_DELETE_ON_DOWNLOAD")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let env_max = parse_env_u64("FILEDROP_MAX_UPLOAD_BYTES", 25 * 1024 * 1024)?;
        let env_exts = env::var("FILEDROP_ALLOWED_EXTENSIONS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_EXTENSIONS.into());
        let env_token = env::var("FILEDROP_ADMIN_TOKEN").unwrap_or_else(|_| "admin123".into());
        let env_base_url = env::var("FILEDROP_PUBLIC_BASE_URL").ok();
        let env_sweep = match env::var("FILEDROP_SWEEP_INTERVAL_SECS") {
            Ok(value) => Some(
                value
                    .parse::<u64>()
                    .with_context(|| format!("parsing FILEDROP_SWEEP_INTERVAL_SECS `{value}`"))?,
            ),
            Err(_) => None,
        };

        // --- Merge ---
        let extensions = args.allowed_extensions.unwrap_or(env_exts);
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            retention: Duration::from_secs(args.retention_secs.unwrap_or(env_retention)),
            delete_on_download: args.delete_on_download || env_delete,
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max),
            allowed_extensions: parse_extension_list(&extensions),
            admin_token: args.admin_token.unwrap_or(env_token),
            public_base_url: args.public_base_url.or(env_base_url),
            sweep_interval: args
                .sweep_interval_secs
                .or(env_sweep)
                .map(Duration::from_secs),
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command-line + environment configuration for the bundler client.
#[derive(Parser, Debug)]
#[command(author, version, about = "Burst-aggregating upload client")]
pub struct BundlerArgs {
    /// Upload endpoint of the exchange (overrides FILEDROP_UPLOAD_URL)
    #[arg(long)]
    pub upload_url: Option<String>,

    /// Debounce quiet period in milliseconds (overrides FILEDROP_QUIET_MS)
    #[arg(long)]
    pub quiet_ms: Option<u64>,

    /// Per-item size limit in bytes (overrides FILEDROP_MAX_ITEM_BYTES)
    #[arg(long)]
    pub max_item_bytes: Option<u64>,

    /// Scratch directory for staged members and archives
    /// (overrides FILEDROP_WORK_DIR)
    #[arg(long)]
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub upload_url: String,
    pub quiet_period: Duration,
    pub max_item_bytes: u64,
    pub work_dir: String,
}

impl BundlerConfig {
    pub fn from_env_and_args() -> Result<Self> {
        let args = BundlerArgs::parse();

        let env_url = env::var("FILEDROP_UPLOAD_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:10000/upload".into());
        let env_quiet = parse_env_u64("FILEDROP_QUIET_MS", 3_000)?;
        let env_max = parse_env_u64("FILEDROP_MAX_ITEM_BYTES", 5 * 1024 * 1024)?;
        let env_work = env::var("FILEDROP_WORK_DIR").unwrap_or_else(|_| "./downloads".into());

        Ok(Self {
            upload_url: args.upload_url.unwrap_or(env_url),
            quiet_period: Duration::from_millis(args.quiet_ms.unwrap_or(env_quiet)),
            max_item_bytes: args.max_item_bytes.unwrap_or(env_max),
            work_dir: args.work_dir.unwrap_or(env_work),
        })
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {name}")),
    }
}

fn parse_extension_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_list_parsing_normalizes() {
        let exts = parse_extension_list("PNG, .jpg ,txt,,gz");
        assert!(exts.contains("png"));
        assert!(exts.contains("jpg"));
        assert!(exts.contains("txt"));
        assert!(exts.contains("gz"));
        assert_eq!(exts.len(), 4);
    }
}
