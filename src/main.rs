use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use media_plane::adapters::{FilesystemAdapter, StorageAdapter};
use media_plane::config;
use media_plane::handlers::AppState;
use media_plane::models::allocation::{
    ProviderConfig, ProviderProfile, Rule, RuleCondition, RuleOperator, RuleValue, StorageStrategy,
};
use media_plane::routes;
use media_plane::services::{
    allocator::StorageAllocator,
    events::EventBus,
    transform_scheduler::{PassthroughExecutor, TransformScheduler},
    upload_manager::UploadManager,
};

/// Files at or above this size route to the bulk provider by default.
const BULK_CUTOFF_BYTES: u64 = 100 * 1024 * 1024;

const SWEEP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting media-plane with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Providers: a fast local tier and a cheap bulk tier ---
    let mut local = FilesystemAdapter::new(&cfg.storage_dir);
    if let Some(quota) = cfg.storage_quota_bytes {
        local = local.with_quota(quota);
    }
    let local = Arc::new(local);
    local.initialize().await?;
    let bulk = Arc::new(FilesystemAdapter::new(format!("{}/bulk", cfg.storage_dir)));
    bulk.initialize().await?;

    let allocator = Arc::new(StorageAllocator::new(&cfg.bucket));
    allocator.add_provider(ProviderConfig {
        name: "local".into(),
        adapter: local,
        priority: 10,
        enabled: true,
        quota_bytes: cfg.storage_quota_bytes,
        profile: ProviderProfile::default(),
    });
    allocator.add_provider(ProviderConfig {
        name: "bulk".into(),
        adapter: bulk,
        priority: 5,
        enabled: true,
        quota_bytes: None,
        profile: ProviderProfile {
            storage_cost_per_gb: 0.004,
            transfer_cost_per_gb: 0.01,
            latency_ms: 200,
            throughput_mbps: 100,
            ..ProviderProfile::default()
        },
    });
    allocator.add_strategy(StorageStrategy {
        name: "large-files-to-bulk".into(),
        enabled: true,
        rules: vec![Rule {
            condition: RuleCondition::FileSize,
            operator: RuleOperator::Gte,
            value: RuleValue::Number(BULK_CUTOFF_BYTES),
            provider: "bulk".into(),
            priority: 10,
        }],
    });

    // --- Core services ---
    let events = Arc::new(EventBus::new());
    let uploads = Arc::new(UploadManager::new(
        allocator.clone(),
        events.clone(),
        cfg.upload.clone(),
    ));
    let transforms = Arc::new(TransformScheduler::new(
        allocator.clone(),
        Arc::new(PassthroughExecutor),
        events.clone(),
        cfg.transform.clone(),
    ));

    // --- Retention sweeps for terminal sessions and jobs ---
    {
        let uploads = uploads.clone();
        let transforms = transforms.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                uploads.sweep_expired().await;
                transforms.sweep_expired().await;
            }
        });
    }

    // --- Build router ---
    let state = AppState {
        uploads,
        transforms,
        allocator,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
