//! Shared wiring for the `PostgreSQL` integration tests
//!
//! Every test connects through `DATABASE_URL` and is skipped when it is not
//! set, so the suite stays green on machines without a database.

#![allow(dead_code)] // Each test binary uses a different subset
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use repoweaver_meta_data::{
    NewRepo, PoolManager, Repo, RepoDescriptor, RepoStore, RevisionFilters, run_migrations,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use repoweaver_test_utils::get_test_runtime;

/// Pools connected to `DATABASE_URL` with migrations applied
///
/// Returns `None` (and says so) when the variable is not set.
pub async fn test_pools() -> Option<PoolManager> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("Skipping test - DATABASE_URL not set");
        return None;
    };
    repoweaver_test_utils::init_test_tracing();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to DATABASE_URL");
    run_migrations(&pool).await.expect("Failed to run migrations");

    Some(PoolManager::from_pool(pool))
}

/// Name unique across test runs and parallel tests
pub fn unique_name(base: &str) -> String {
    let counter = repoweaver_test_utils::next_fixture_counter();
    format!("{base}-{}-{counter}", uuid::Uuid::new_v4().simple())
}

/// Hosted repository descriptor with a fresh external id
pub fn new_hosted_repo(base: &str) -> NewRepo {
    let name = unique_name(base);
    let clone_url = format!("https://github.com/repoweaver-tests/{name}.git");
    RepoDescriptor {
        external_id: name,
        code_host_type: "github".to_string(),
        code_host_url: "https://github.com".to_string(),
        clone_url,
        is_public: true,
        ..RepoDescriptor::default()
    }
    .compile(1, &RevisionFilters::default())
}

/// Insert `count` repositories through a fresh connection, returning both
pub async fn insert_linked_repos(store: &dyn RepoStore, count: usize) -> (i64, Vec<Repo>) {
    let connection_id = store
        .upsert_connection(1, &unique_name("connection"), "github", &serde_json::json!({}))
        .await
        .expect("Failed to create connection");
    let repos: Vec<NewRepo> = (0..count).map(|_| new_hosted_repo("repo")).collect();
    let outcome = store
        .upsert_repos(connection_id, &repos)
        .await
        .expect("Failed to insert repositories");
    assert_eq!(outcome.created.len(), count);

    (connection_id, outcome.created)
}

pub async fn set_auto_cleanup_disabled(pool: &PgPool, repo_id: i64) {
    sqlx::query("UPDATE repos SET is_auto_cleanup_disabled = TRUE WHERE id = $1")
        .bind(repo_id)
        .execute(pool)
        .await
        .expect("Failed to pin repository");
}
