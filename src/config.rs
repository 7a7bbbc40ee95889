//! Centralized application configuration.
//! Combines environment variables and CLI arguments; CLI wins, then the
//! environment, then defaults.

use crate::services::{transform_scheduler::TransformConfig, upload_manager::UploadConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Optional byte limit reported by the local storage provider.
    pub storage_quota_bytes: Option<u64>,
    /// Logical bucket label stamped onto allocations.
    pub bucket: String,
    pub upload: UploadConfig,
    pub transform: TransformConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media data plane: chunked uploads, storage allocation, transforms")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_PLANE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_PLANE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory backing the local storage provider (overrides MEDIA_PLANE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket label for allocations (overrides MEDIA_PLANE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum concurrently executing transform jobs
    #[arg(long)]
    pub max_concurrent_jobs: Option<usize>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        let env_host = env::var("MEDIA_PLANE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("MEDIA_PLANE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing MEDIA_PLANE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading MEDIA_PLANE_PORT"),
        };
        let env_storage =
            env::var("MEDIA_PLANE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let storage_quota_bytes = env_opt_u64("MEDIA_PLANE_STORAGE_QUOTA_BYTES")?;
        let env_bucket = env::var("MEDIA_PLANE_BUCKET").unwrap_or_else(|_| "media".into());

        let mut upload = UploadConfig::default();
        upload.default_chunk_size =
            env_u64("MEDIA_PLANE_DEFAULT_CHUNK_SIZE", upload.default_chunk_size)?;
        upload.max_retries = env_u64("MEDIA_PLANE_MAX_RETRIES", upload.max_retries as u64)? as u32;
        upload.base_delay_ms = env_u64("MEDIA_PLANE_RETRY_BASE_DELAY_MS", upload.base_delay_ms)?;
        upload.retention_secs =
            env_u64("MEDIA_PLANE_SESSION_RETENTION_SECS", upload.retention_secs)?;

        let mut transform = TransformConfig::default();
        transform.max_concurrent_jobs = env_u64(
            "MEDIA_PLANE_MAX_CONCURRENT_JOBS",
            transform.max_concurrent_jobs as u64,
        )? as usize;
        transform.retry_attempts = env_u64(
            "MEDIA_PLANE_TRANSFORM_RETRY_ATTEMPTS",
            transform.retry_attempts as u64,
        )? as u32;
        transform.job_timeout_ms =
            env_u64("MEDIA_PLANE_JOB_TIMEOUT_MS", transform.job_timeout_ms)?;
        transform.cache_ttl_secs =
            env_u64("MEDIA_PLANE_CACHE_TTL_SECS", transform.cache_ttl_secs)?;
        if let Some(value) = args.max_concurrent_jobs {
            transform.max_concurrent_jobs = value;
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            storage_quota_bytes,
            bucket: args.bucket.unwrap_or(env_bucket),
            upload,
            transform,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {name}")),
    }
}

fn env_opt_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).context(format!("reading {name}")),
    }
}
