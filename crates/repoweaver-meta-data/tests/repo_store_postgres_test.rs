//! Scheduling scans and job transitions against a live `PostgreSQL`

#![allow(clippy::unwrap_used)] // Tests can use unwrap for assertions
#![allow(clippy::indexing_slicing)] // Tests can use direct indexing

#[path = "test_utils.rs"]
mod test_utils;

use chrono::{DateTime, TimeDelta, Utc};
use repoweaver_meta_data::{
    DbRepoStore, IndexSuccess, JobStatus, JobType, Repo, RepoIndexingStatus, RepoStore,
};
use std::time::Duration;
use test_utils::{get_test_runtime, insert_linked_repos, set_auto_cleanup_disabled, test_pools};

const REINDEX_INTERVAL: Duration = Duration::from_secs(60 * 60);
const JOB_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const GC_GRACE_PERIOD: Duration = Duration::from_secs(10);

fn contains(repos: &[Repo], repo_id: i64) -> bool {
    repos.iter().any(|r| r.id == repo_id)
}

async fn index_candidate_at(store: &DbRepoStore, repo_id: i64, now: DateTime<Utc>) -> bool {
    let candidates = store
        .find_index_candidates(now, REINDEX_INTERVAL, JOB_TIMEOUT)
        .await
        .unwrap();
    contains(&candidates, repo_id)
}

#[test]
fn test_reindex_waits_for_the_full_interval() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let store = DbRepoStore::new(pools);
        let (_, repos) = insert_linked_repos(&store, 1).await;
        let repo_id = repos[0].id;

        let indexed_at = Utc::now();
        store
            .record_index_success(
                repo_id,
                &IndexSuccess {
                    indexed_commit_hash: Some("abc123".to_string()),
                    indexed_revisions: vec!["refs/heads/main".to_string()],
                    ..IndexSuccess::default()
                },
                indexed_at,
            )
            .await
            .unwrap();

        let stored = store.get_repo(repo_id).await.unwrap().unwrap();
        assert_eq!(stored.indexing_status, RepoIndexingStatus::Indexed);
        assert_eq!(
            stored.metadata.indexed_revisions,
            Some(vec!["refs/heads/main".to_string()])
        );

        assert!(!index_candidate_at(&store, repo_id, indexed_at + TimeDelta::milliseconds(1_800_000)).await);
        assert!(index_candidate_at(&store, repo_id, indexed_at + TimeDelta::milliseconds(3_600_001)).await);

        assert!(store.delete_repo(repo_id).await.unwrap());
    });
}

#[test]
fn test_recent_failed_job_blocks_reindex() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let store = DbRepoStore::new(pools);
        let (_, repos) = insert_linked_repos(&store, 1).await;
        let repo_id = repos[0].id;
        assert!(index_candidate_at(&store, repo_id, Utc::now()).await);

        let job = store.create_jobs(&repos, JobType::Index).await.unwrap()[0].clone();
        assert_eq!(
            store.get_repo(repo_id).await.unwrap().unwrap().indexing_status,
            RepoIndexingStatus::InQueue
        );
        assert!(store.start_job(job.id).await.unwrap().is_some());
        let failed = store.fail_job(job.id, "clone failed").await.unwrap().unwrap();
        assert_eq!(failed.previous_status, JobStatus::InProgress);
        assert_eq!(failed.repo.indexing_status, RepoIndexingStatus::Failed);
        assert!(failed.job.completed_at.is_some());

        // A terminal job is never reopened
        assert!(store.complete_job(job.id).await.unwrap().is_none());

        assert!(!index_candidate_at(&store, repo_id, Utc::now()).await);
        assert!(index_candidate_at(&store, repo_id, Utc::now() + TimeDelta::minutes(61)).await);

        assert!(store.delete_repo(repo_id).await.unwrap());
    });
}

#[test]
fn test_active_job_blocks_reindex_until_it_times_out() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let store = DbRepoStore::new(pools);
        let (_, repos) = insert_linked_repos(&store, 1).await;
        let repo_id = repos[0].id;

        store.create_jobs(&repos, JobType::Index).await.unwrap();

        assert!(!index_candidate_at(&store, repo_id, Utc::now()).await);
        assert!(index_candidate_at(&store, repo_id, Utc::now() + TimeDelta::minutes(121)).await);

        assert!(store.delete_repo(repo_id).await.unwrap());
    });
}

#[test]
fn test_cleanup_skips_linked_and_pinned_repositories() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let write_pool = pools.write_pool().clone();
        let store = DbRepoStore::new(pools);
        let (connection_id, repos) = insert_linked_repos(&store, 2).await;
        let (orphan, pinned) = (repos[0].id, repos[1].id);
        set_auto_cleanup_disabled(&write_pool, pinned).await;

        let find = || store.find_cleanup_candidates(Utc::now(), GC_GRACE_PERIOD, JOB_TIMEOUT);

        let linked = find().await.unwrap();
        assert!(!contains(&linked, orphan));
        assert!(!contains(&linked, pinned));

        let outcome = store.upsert_repos(connection_id, &[]).await.unwrap();
        assert_eq!(outcome.unlinked, 2);

        let unlinked = find().await.unwrap();
        assert!(contains(&unlinked, orphan));
        assert!(!contains(&unlinked, pinned));

        store
            .create_jobs(std::slice::from_ref(&repos[0]), JobType::Cleanup)
            .await
            .unwrap();
        assert_eq!(
            store.get_repo(orphan).await.unwrap().unwrap().indexing_status,
            RepoIndexingStatus::InGcQueue
        );
        assert!(!contains(&find().await.unwrap(), orphan));

        assert!(store.delete_repo(orphan).await.unwrap());
        assert!(!store.delete_repo(orphan).await.unwrap());
        assert!(store.delete_repo(pinned).await.unwrap());
    });
}
