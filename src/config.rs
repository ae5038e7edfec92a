use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

use crate::{
    models::bundle_rule::BundlePolicy,
    services::{bundler::BundlerSettings, retry::RetryPolicy, rule_store},
};

/// Where uploaded objects are staged before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StagingBackend {
    Local,
    Remote,
}

impl FromStr for StagingBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => bail!("unknown staging backend `{}` (expected local or remote)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub staging_backend: StagingBackend,
    pub remote_endpoint: Option<String>,
    pub remote_bucket: String,
    pub bundler_accounts: Vec<String>,
    pub finalize_interval: Duration,
    pub submit_interval: Duration,
    pub seal_interval: Duration,
    pub max_seal_time: Duration,
    pub retry_intervals: Vec<Duration>,
    pub default_policy: BundlePolicy,
    pub max_object_size: u64,
    /// Seal chain objects as soon as they are uploaded (in-process ledger).
    pub auto_seal: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Bundles small objects into chain objects")]
pub struct Args {
    /// Host to bind to (overrides BUNDLE_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUNDLE_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for staged objects and packed bundles (overrides BUNDLE_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides BUNDLE_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Staging backend (overrides BUNDLE_SERVICE_STAGING)
    #[arg(long, value_enum)]
    pub staging: Option<StagingBackend>,

    /// Remote staging endpoint, e.g. http://127.0.0.1:9000 (overrides BUNDLE_SERVICE_REMOTE_ENDPOINT)
    #[arg(long)]
    pub remote_endpoint: Option<String>,

    /// Remote staging bucket (overrides BUNDLE_SERVICE_REMOTE_BUCKET)
    #[arg(long)]
    pub remote_bucket: Option<String>,

    /// Comma-separated bundler account addresses (overrides BUNDLE_SERVICE_BUNDLER_ACCOUNTS)
    #[arg(long)]
    pub bundler_accounts: Option<String>,

    /// Maximum seconds a created bundle may stay unsealed (overrides BUNDLE_SERVICE_MAX_SEAL_TIME)
    #[arg(long)]
    pub max_seal_time: Option<u64>,

    /// Seal chain objects on upload (overrides BUNDLE_SERVICE_AUTO_SEAL)
    #[arg(long)]
    pub auto_seal: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    env_or(key, default).map(Duration::from_secs)
}

/// Parse `"60,600,1800"` into durations.
fn parse_secs_list(key: &str, raw: &str) -> Result<Vec<Duration>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("parsing {} entry `{}`", key, s))
        })
        .collect()
}

fn split_accounts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge `args` over the environment over built-in defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("BUNDLE_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("BUNDLE_SERVICE_PORT", 3000u16)?;
        let env_storage =
            env::var("BUNDLE_SERVICE_STORAGE_DIR").unwrap_or_else(|_| "./data/bundles".into());
        let env_db = env::var("BUNDLE_SERVICE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/bundle_service.db".into());
        let env_staging = env_or("BUNDLE_SERVICE_STAGING", StagingBackend::Local)?;
        let env_endpoint = env::var("BUNDLE_SERVICE_REMOTE_ENDPOINT").ok();
        let env_remote_bucket =
            env::var("BUNDLE_SERVICE_REMOTE_BUCKET").unwrap_or_else(|_| "bundle-staging".into());
        let env_accounts = env::var("BUNDLE_SERVICE_BUNDLER_ACCOUNTS")
            .unwrap_or_else(|_| "0xbundler-0".into());
        let env_max_seal = env_or("BUNDLE_SERVICE_MAX_SEAL_TIME", 24 * 60 * 60u64)?;
        let env_auto_seal = env_or("BUNDLE_SERVICE_AUTO_SEAL", true)?;

        let retry_intervals = match env::var("BUNDLE_SERVICE_RETRY_INTERVALS") {
            Ok(raw) => parse_secs_list("BUNDLE_SERVICE_RETRY_INTERVALS", &raw)?,
            Err(_) => RetryPolicy::default().intervals().to_vec(),
        };

        let defaults = BundlePolicy::default();
        let default_policy = BundlePolicy {
            max_files: env_or("BUNDLE_SERVICE_DEFAULT_MAX_FILES", defaults.max_files)?,
            max_size: env_or("BUNDLE_SERVICE_DEFAULT_MAX_SIZE", defaults.max_size)?,
            max_finalize_time: env_or(
                "BUNDLE_SERVICE_DEFAULT_MAX_FINALIZE_TIME",
                defaults.max_finalize_time,
            )?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            staging_backend: args.staging.unwrap_or(env_staging),
            remote_endpoint: args.remote_endpoint.or(env_endpoint),
            remote_bucket: args.remote_bucket.unwrap_or(env_remote_bucket),
            bundler_accounts: split_accounts(&args.bundler_accounts.unwrap_or(env_accounts)),
            finalize_interval: env_secs("BUNDLE_SERVICE_FINALIZE_INTERVAL", 1)?,
            submit_interval: env_secs("BUNDLE_SERVICE_SUBMIT_INTERVAL", 1)?,
            seal_interval: env_secs("BUNDLE_SERVICE_SEAL_INTERVAL", 30)?,
            max_seal_time: Duration::from_secs(args.max_seal_time.unwrap_or(env_max_seal)),
            retry_intervals,
            default_policy,
            max_object_size: env_or("BUNDLE_SERVICE_MAX_OBJECT_SIZE", 10 * 1024 * 1024u64)?,
            auto_seal: args.auto_seal.unwrap_or(env_auto_seal),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.bundler_accounts.is_empty() {
            bail!("at least one bundler account is required");
        }
        if self.staging_backend == StagingBackend::Remote && self.remote_endpoint.is_none() {
            bail!("remote staging needs BUNDLE_SERVICE_REMOTE_ENDPOINT or --remote-endpoint");
        }
        for interval in [self.finalize_interval, self.submit_interval, self.seal_interval] {
            if interval.is_zero() {
                bail!("loop intervals must be at least one second");
            }
        }
        rule_store::validate(&self.default_policy).context("invalid default bundle policy")?;
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bundler_settings(&self) -> BundlerSettings {
        BundlerSettings {
            finalize_interval: self.finalize_interval,
            submit_interval: self.submit_interval,
            seal_interval: self.seal_interval,
            max_seal_time: self.max_seal_time,
            retry: RetryPolicy::new(self.retry_intervals.clone()),
        }
    }
}
