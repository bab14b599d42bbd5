//! Cleanup of repositories no connection references any more

#![allow(clippy::unwrap_used)] // Tests can use unwrap for assertions
#![allow(clippy::indexing_slicing)] // Tests can use direct indexing


use chrono::{TimeDelta, Utc};
use repoweaver_indexing::telemetry::{ACTIVE_JOBS, JOB_SUCCESS_TOTAL, PENDING_JOBS};
use repoweaver_meta_data::mock_queue::EntryStatus;
use repoweaver_meta_data::{JobType, RepoIndexingStatus, RevisionFilters};
use repoweaver_test_utils::GitFixture;
use test_utils::{Harness, hosted_descriptor, new_repo};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_cleanup_removes_working_copy_shards_and_row() {
    let harness = Harness::new(&[]);
    let repo = harness
        .store
        .insert_repo(&new_repo(&hosted_descriptor("https://github.com/org/gone.git")));
    harness
        .store
        .update_repo(repo.id, |r| r.indexed_at = Some(Utc::now() - TimeDelta::minutes(30)));

    let working_copy = harness.data_dir.path().join("repos").join(repo.id.to_string());
    std::fs::create_dir_all(working_copy.join("objects")).unwrap();
    let index_dir = harness.index_dir();
    std::fs::create_dir_all(&index_dir).unwrap();
    let own = [
        format!("1_{}_v16.00000.zoekt", repo.id),
        format!("1_{}_v16.00001.zoekt", repo.id),
        format!("1_{}.meta", repo.id),
    ];
    let neighbour = format!("1_{}0_v16.00000.zoekt", repo.id);
    for name in own.iter().chain(std::iter::once(&neighbour)) {
        std::fs::write(index_dir.join(name), b"shard").unwrap();
    }

    let report = harness
        .manager
        .scheduler()
        .schedule_once(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.cleanup_jobs, 1);
    assert_eq!(
        harness.store.repo(repo.id).unwrap().indexing_status,
        RepoIndexingStatus::InGcQueue
    );

    let processed = harness
        .worker(JobType::Cleanup)
        .process_one_job(&CancellationToken::new())
        .await
        .unwrap();
    assert!(processed.is_some());

    assert!(!working_copy.exists());
    for name in &own {
        assert!(!index_dir.join(name).exists(), "{name} should be deleted");
    }
    assert!(index_dir.join(&neighbour).exists());

    assert!(harness.store.repo(repo.id).is_none());
    let cleanup_entries: Vec<_> = harness
        .queue
        .entries()
        .into_iter()
        .filter(|e| e.payload.job_type == JobType::Cleanup)
        .collect();
    assert_eq!(cleanup_entries[0].status, EntryStatus::Completed);
    assert!(harness.events.names().contains(&"repo_deleted"));

    let name = "github.com/org/gone";
    assert!(harness.metrics.value(PENDING_JOBS, name, JobType::Cleanup).abs() < f64::EPSILON);
    assert!(harness.metrics.value(ACTIVE_JOBS, name, JobType::Cleanup).abs() < f64::EPSILON);
    assert!((harness.metrics.value(JOB_SUCCESS_TOTAL, name, JobType::Cleanup) - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_cleanup_keeps_local_working_copy() {
    let local = GitFixture::new();
    local.commit("README.md", "local", "initial");
    local.set_origin("https://github.com/test/local.git");
    let harness = Harness::new(&[]);
    let discovered = repoweaver_meta_data::compile_local_git_descriptors(
        &local.path().display().to_string(),
    );
    let repo = harness
        .store
        .insert_repo(&discovered.repositories[0].compile(1, &RevisionFilters::default()));
    harness
        .store
        .update_repo(repo.id, |r| r.indexed_at = Some(Utc::now() - TimeDelta::minutes(30)));

    harness
        .manager
        .scheduler()
        .schedule_once(Utc::now())
        .await
        .unwrap();
    harness
        .worker(JobType::Cleanup)
        .process_one_job(&CancellationToken::new())
        .await
        .unwrap();

    assert!(local.path().join(".git").exists());
    assert!(harness.store.repo(repo.id).is_none());
}

#[tokio::test]
async fn test_linked_and_pinned_repositories_are_not_collected() {
    let harness = Harness::new(&[]);
    let linked = harness.add_repo(
        &hosted_descriptor("https://github.com/org/linked.git"),
        &RevisionFilters::default(),
    );
    let pinned = harness
        .store
        .insert_repo(&new_repo(&hosted_descriptor("https://github.com/org/pinned.git")));
    harness.store.update_repo(pinned.id, |r| {
        r.is_auto_cleanup_disabled = true;
        r.indexed_at = Some(Utc::now() - TimeDelta::minutes(30));
    });
    harness
        .store
        .update_repo(linked.id, |r| r.indexed_at = Some(Utc::now() - TimeDelta::minutes(30)));

    let report = harness
        .manager
        .scheduler()
        .schedule_once(Utc::now())
        .await
        .unwrap();

    assert_eq!(report.cleanup_jobs, 0);
}

#[tokio::test]
async fn test_failed_row_delete_is_not_counted_as_success() {
    let harness = Harness::new(&[]);
    let repo = harness
        .store
        .insert_repo(&new_repo(&hosted_descriptor("https://github.com/org/stuck.git")));
    harness
        .store
        .update_repo(repo.id, |r| r.indexed_at = Some(Utc::now() - TimeDelta::minutes(30)));
    harness.store.fail_operation("delete_repo", "connection reset");

    harness
        .manager
        .scheduler()
        .schedule_once(Utc::now())
        .await
        .unwrap();
    harness
        .worker(JobType::Cleanup)
        .process_one_job(&CancellationToken::new())
        .await
        .unwrap();

    assert!(harness.store.repo(repo.id).is_some());
    assert!(!harness.events.names().contains(&"repo_deleted"));

    let name = "github.com/org/stuck";
    assert!(harness.metrics.value(ACTIVE_JOBS, name, JobType::Cleanup).abs() < f64::EPSILON);
    assert!(harness.metrics.value(JOB_SUCCESS_TOTAL, name, JobType::Cleanup).abs() < f64::EPSILON);
}
