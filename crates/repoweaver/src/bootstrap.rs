//! Process bootstrap and service wiring
//!
//! Builds the database pools, lock, git client, index builder and telemetry
//! sinks from the application configuration and hands them to the manager
//! and connection syncer.

use anyhow::Context;
use repoweaver_config::{ApplicationConfig, ConnectionConfig, LockBackend, LockConfig, TelemetryConfig};
use repoweaver_indexing::{
    CliGitClient, ConnectionSyncer, CredentialProvider, JobMetrics, LocalGitDiscovery,
    ManagerDeps, ManagerSettings, NoCredentials, PrometheusJobMetrics, RepoDiscovery,
    RepoIndexManager, SyncerSettings, TokenCredentials, TracingEventSink, WorkerConfig,
    ZoektIndexBuilder,
};
use repoweaver_meta_data::{
    DbRepoStore, DistributedLock, InMemoryLeaseStore, JobType, LeaseStore, PoolManager,
    PostgresJobQueue, PostgresLeaseStore, RepoStore, wait_for_migrations,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bootstrap result type
pub type BootstrapResult<T> = anyhow::Result<T>;

/// Connections per quorum lease database; leases are tiny single-row writes
const QUORUM_POOL_SIZE: u32 = 2;

/// Everything `run` needs, fully wired
pub struct Services {
    pub manager: Arc<RepoIndexManager>,
    pub syncer: ConnectionSyncer,
    pub index_worker: WorkerConfig,
    pub cleanup_worker: WorkerConfig,
    pub pools: PoolManager,
}

/// Connect to the database, retrying until it is up, and run migrations
///
/// # Errors
///
/// Returns error if the database never becomes reachable or migration fails
pub async fn setup_database(config: &ApplicationConfig) -> BootstrapResult<PoolManager> {
    info!(
        database = %config.database.safe_connection_string(),
        "Initializing database connection pools..."
    );
    wait_for_migrations(&config.database).await
}

/// Build the repository lock over the configured lease stores
///
/// Quorum databases connect lazily so one unreachable member does not block
/// startup; the lock only needs a majority.
///
/// # Errors
///
/// Returns error if a quorum URL cannot be parsed
pub fn setup_lock(config: &LockConfig, primary: &PgPool) -> BootstrapResult<DistributedLock> {
    let stores: Vec<Arc<dyn LeaseStore>> = match config.backend {
        LockBackend::Memory => {
            warn!("Using in-memory repository locks; run a single orchestrator process only");
            vec![Arc::new(InMemoryLeaseStore::new("memory"))]
        }
        LockBackend::Postgres => {
            let mut stores: Vec<Arc<dyn LeaseStore>> =
                vec![Arc::new(PostgresLeaseStore::new("primary", primary.clone()))];
            for (index, url) in config.quorum_urls.iter().enumerate() {
                let pool = PgPoolOptions::new()
                    .max_connections(QUORUM_POOL_SIZE)
                    .connect_lazy(url)
                    .with_context(|| format!("Invalid lock quorum url #{index}"))?;
                stores.push(Arc::new(PostgresLeaseStore::new(format!("quorum-{index}"), pool)));
            }
            stores
        }
    };

    info!(
        backend = ?config.backend,
        stores = stores.len(),
        "Repository lock configured"
    );
    Ok(DistributedLock::new(stores, config.extension_threshold))
}

/// Install the Prometheus exporter when enabled
///
/// # Errors
///
/// Returns error if the exporter cannot bind its listener
pub fn setup_metrics(telemetry: &TelemetryConfig) -> BootstrapResult<Arc<dyn JobMetrics>> {
    if telemetry.enable_metrics {
        let addr = SocketAddr::from(([0, 0, 0, 0], telemetry.metrics_port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        PrometheusJobMetrics::describe();
        info!(%addr, "Serving Prometheus metrics");
    }
    Ok(Arc::new(PrometheusJobMetrics))
}

/// Bearer-token credentials when a token is configured, none otherwise
pub fn setup_credentials(config: &ApplicationConfig) -> Arc<dyn CredentialProvider> {
    match &config.indexing.auth_token {
        Some(token) => Arc::new(TokenCredentials::new(token.clone())),
        None => Arc::new(NoCredentials),
    }
}

/// Upsert the configured connections so the syncer picks them up
///
/// # Errors
///
/// Returns error if a connection row cannot be written
pub async fn register_connections(
    store: &dyn RepoStore,
    connections: &[ConnectionConfig],
) -> BootstrapResult<Vec<i64>> {
    let mut ids = Vec::with_capacity(connections.len());
    for connection in connections {
        let id = store
            .upsert_connection(
                connection.org_id,
                &connection.name,
                &connection.connection_type,
                &connection.config,
            )
            .await
            .with_context(|| format!("Failed to register connection {}", connection.name))?;
        info!(connection = %connection.name, id, "Registered connection");
        ids.push(id);
    }
    Ok(ids)
}

/// Wire every service from `config`
///
/// # Errors
///
/// Returns error if any service initialization fails
pub async fn initialize_services(config: &ApplicationConfig) -> BootstrapResult<Services> {
    // 1. Database (needed by everything else)
    let pools = setup_database(config).await?;
    let store: Arc<dyn RepoStore> = Arc::new(DbRepoStore::new(pools.clone()));
    let queue = Arc::new(PostgresJobQueue::new(
        pools.write_pool().clone(),
        config.queue.max_attempts,
    ));

    // 2. Connections from config
    register_connections(store.as_ref(), &config.connections).await?;

    // 3. Lock, telemetry and external tools
    let lock = setup_lock(&config.lock, pools.write_pool())?;
    let metrics = setup_metrics(&config.telemetry)?;
    let events = Arc::new(TracingEventSink);
    let settings = ManagerSettings::from_app_config(config);
    let index_builder = Arc::new(ZoektIndexBuilder::new(
        &config.indexing.index_builder_binary,
        &settings.index_dir,
        config.indexing.max_trigram_count,
        config.indexing.max_file_size,
    ));

    // 4. Manager and syncer
    let manager = Arc::new(RepoIndexManager::new(ManagerDeps {
        store: Arc::clone(&store),
        queue,
        lock,
        git: Arc::new(CliGitClient::default()),
        index_builder,
        credentials: setup_credentials(config),
        metrics,
        events: Arc::clone(&events) as _,
        settings,
    }));
    let discoveries: Vec<Arc<dyn RepoDiscovery>> = vec![Arc::new(LocalGitDiscovery)];
    let syncer = ConnectionSyncer::new(
        store,
        discoveries,
        events,
        SyncerSettings::from_app_config(config),
    );

    info!("Services initialized successfully");
    Ok(Services {
        manager,
        syncer,
        index_worker: WorkerConfig::from_app_config(config, JobType::Index),
        cleanup_worker: WorkerConfig::from_app_config(config, JobType::Cleanup),
        pools,
    })
}

/// Run the manager and syncer until `shutdown` is cancelled, then close the pools
pub async fn run(services: Services, shutdown: CancellationToken) {
    let Services {
        manager,
        syncer,
        index_worker,
        cleanup_worker,
        pools,
    } = services;

    tokio::join!(
        manager.run(index_worker, cleanup_worker, shutdown.clone()),
        syncer.run(shutdown.clone()),
    );

    pools.close().await;
    info!("🛑 repoweaver stopped");
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        () = terminate => info!("Received terminate signal, initiating graceful shutdown"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use repoweaver_meta_data::MockRepoStore;
    use serde_json::json;

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://repoweaver@localhost/repoweaver")
            .unwrap()
    }

    fn lock_config(backend: LockBackend, quorum_urls: Vec<String>) -> LockConfig {
        LockConfig {
            backend,
            ttl_ms: 60_000,
            extension_threshold: 0.5,
            contention_retry_delay_ms: 5000,
            quorum_urls,
        }
    }

    #[tokio::test]
    async fn test_memory_lock_uses_one_store() {
        let lock = setup_lock(&lock_config(LockBackend::Memory, vec![]), &lazy_pool()).unwrap();
        assert_eq!(lock.quorum(), 1);
    }

    #[tokio::test]
    async fn test_postgres_lock_adds_quorum_members() {
        let config = lock_config(
            LockBackend::Postgres,
            vec![
                "postgres://a@lock-1/locks".to_string(),
                "postgres://a@lock-2/locks".to_string(),
            ],
        );
        let lock = setup_lock(&config, &lazy_pool()).unwrap();
        assert_eq!(lock.quorum(), 2);
    }

    #[tokio::test]
    async fn test_invalid_quorum_url_is_rejected() {
        let config = lock_config(LockBackend::Postgres, vec!["not a url".to_string()]);
        assert!(setup_lock(&config, &lazy_pool()).is_err());
    }

    #[tokio::test]
    async fn test_register_connections_is_idempotent() {
        let store = MockRepoStore::new();
        let connections = vec![ConnectionConfig {
            org_id: 1,
            name: "local".to_string(),
            connection_type: "git".to_string(),
            config: json!({ "url": "file:///srv/git/*" }),
        }];

        let first = register_connections(&store, &connections).await.unwrap();
        let second = register_connections(&store, &connections).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_credentials_follow_token_setting() {
        let repo = repoweaver_indexing::testing::sample_repo(1, "github.com/org/repo");
        let mut config = ApplicationConfig::from_env();

        config.indexing.auth_token = None;
        let anonymous = setup_credentials(&config).credentials_for(&repo).await;
        assert!(anonymous.auth_header.is_none());

        config.indexing.auth_token = Some("token".to_string());
        let authed = setup_credentials(&config).credentials_for(&repo).await;
        assert_eq!(authed.auth_header.as_deref(), Some("Authorization: Bearer token"));
    }
}
