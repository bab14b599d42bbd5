//! Connection sync: discover repositories and reconcile them into rows

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use repoweaver_config::ApplicationConfig;
use repoweaver_meta_data::{
    Connection, DiscoveryResult, NewRepo, RepoStore, RevisionFilters,
    compile_local_git_descriptors,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::telemetry::{Event, EventSink};
use crate::{IndexerError, IndexerResult};

/// Connection type served by [`LocalGitDiscovery`]
pub const LOCAL_GIT_CONNECTION_TYPE: &str = "git";

/// Finds the repositories behind a connection
#[async_trait]
pub trait RepoDiscovery: Send + Sync {
    fn supports(&self, connection_type: &str) -> bool;

    async fn discover(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> IndexerResult<DiscoveryResult>;
}

/// Discovers git repositories on the local filesystem
///
/// The connection config carries `{"url": "file://<glob>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGitDiscovery;

#[async_trait]
impl RepoDiscovery for LocalGitDiscovery {
    fn supports(&self, connection_type: &str) -> bool {
        connection_type == LOCAL_GIT_CONNECTION_TYPE
    }

    async fn discover(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> IndexerResult<DiscoveryResult> {
        let url = connection
            .config
            .get("url")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let Some(pattern) = url.strip_prefix("file://") else {
            return Ok(DiscoveryResult {
                repositories: Vec::new(),
                warnings: vec![format!(
                    "Connection {} must use a file:// url, got {url:?}",
                    connection.name
                )],
            });
        };

        let pattern = pattern.to_string();
        let task = tokio::task::spawn_blocking(move || compile_local_git_descriptors(&pattern));
        tokio::select! {
            () = cancel.cancelled() => Err(IndexerError::Cancelled),
            joined = task => joined.map_err(|e| {
                IndexerError::io("local git discovery task failed", std::io::Error::other(e))
            }),
        }
    }
}

/// Result of syncing one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub connection_id: i64,
    pub repo_count: usize,
    pub created: usize,
    pub updated: usize,
    pub unlinked: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncerSettings {
    pub polling_interval: Duration,
    pub resync_interval: Duration,
}

impl SyncerSettings {
    pub fn from_app_config(config: &ApplicationConfig) -> Self {
        Self {
            polling_interval: Duration::from_millis(
                config.indexing.resync_connection_polling_interval_ms,
            ),
            resync_interval: Duration::from_millis(config.indexing.resync_connection_interval_ms),
        }
    }
}

/// Periodically re-discovers each connection's repositories
pub struct ConnectionSyncer {
    store: Arc<dyn RepoStore>,
    discoveries: Vec<Arc<dyn RepoDiscovery>>,
    events: Arc<dyn EventSink>,
    settings: SyncerSettings,
}

impl ConnectionSyncer {
    pub fn new(
        store: Arc<dyn RepoStore>,
        discoveries: Vec<Arc<dyn RepoDiscovery>>,
        events: Arc<dyn EventSink>,
        settings: SyncerSettings,
    ) -> Self {
        Self {
            store,
            discoveries,
            events,
            settings,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            polling_interval_ms = self.settings.polling_interval.as_millis(),
            "Connection syncer started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.settings.polling_interval) => {}
            }

            if let Err(e) = self.sync_once(Utc::now(), &shutdown).await {
                error!(error = %e, "Connection sync pass failed");
            }
        }
        info!("Connection syncer stopped");
    }

    /// Sync every connection that is due as of `now`
    ///
    /// A failing connection is logged and left due; the others still sync.
    pub async fn sync_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> IndexerResult<Vec<SyncReport>> {
        let due = self
            .store
            .connections_due_for_sync(now, self.settings.resync_interval)
            .await?;

        let mut reports = Vec::with_capacity(due.len());
        for connection in due {
            if cancel.is_cancelled() {
                break;
            }
            match self.sync_connection(&connection, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_cancellation() => break,
                Err(e) => error!(
                    connection_id = connection.id,
                    connection = %connection.name,
                    error = %e,
                    "Failed to sync connection"
                ),
            }
        }
        Ok(reports)
    }

    pub async fn sync_connection(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> IndexerResult<SyncReport> {
        let mut report = SyncReport {
            connection_id: connection.id,
            ..SyncReport::default()
        };

        let Some(discovery) = self
            .discoveries
            .iter()
            .find(|d| d.supports(&connection.connection_type))
        else {
            warn!(
                connection = %connection.name,
                connection_type = %connection.connection_type,
                "No discovery available for connection type, skipping"
            );
            self.store
                .mark_connection_synced(connection.id, Utc::now())
                .await?;
            return Ok(report);
        };

        let discovered = discovery.discover(connection, cancel).await?;
        for warning in &discovered.warnings {
            warn!(connection = %connection.name, "{warning}");
        }

        let revisions = revision_filters(&connection.config);
        let repos: Vec<NewRepo> = discovered
            .repositories
            .iter()
            .map(|descriptor| descriptor.compile(connection.org_id, &revisions))
            .collect();

        let outcome = self.store.upsert_repos(connection.id, &repos).await?;
        for repo in &outcome.created {
            self.events.capture(Event::RepoCreated {
                repo_id: repo.id,
                org_id: repo.org_id,
                connection_id: connection.id,
            });
        }

        report.repo_count = repos.len();
        report.created = outcome.created.len();
        report.updated = outcome.updated;
        report.unlinked = outcome.unlinked;
        report.warnings = discovered.warnings;

        self.events.capture(Event::RepoSynced {
            connection_id: connection.id,
            org_id: connection.org_id,
            repo_count: report.repo_count,
            created: report.created,
            unlinked: report.unlinked,
        });
        self.store
            .mark_connection_synced(connection.id, Utc::now())
            .await?;

        info!(
            connection = %connection.name,
            repos = report.repo_count,
            created = report.created,
            unlinked = report.unlinked,
            "Synced connection"
        );
        Ok(report)
    }
}

/// Branch and tag globs under the connection config's `revisions` key
fn revision_filters(config: &serde_json::Value) -> RevisionFilters {
    config
        .get("revisions")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}
