//! Shared test utilities for all repoweaver integration tests
//!
//! Provides a persistent Tokio runtime shared across integration tests in
//! every crate, plus [`GitFixture`] for building throwaway repositories.
//!
//! ## Usage
//!
//! In your test crate's `Cargo.toml`:
//! ```toml
//! [dev-dependencies]
//! repoweaver-test-utils = { path = "../repoweaver-test-utils" }
//! ```
//!
//! In your tests:
//! ```no_run
//! #[test]
//! fn my_integration_test() {
//!     repoweaver_test_utils::get_test_runtime().block_on(async {
//!         let fixture = repoweaver_test_utils::GitFixture::new();
//!         fixture.commit("README.md", "hello", "initial");
//!         // ... test logic ...
//!     })
//! }
//! ```

use git2::{Repository, RepositoryInitOptions, Signature};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Shared Tokio runtime for integration tests across all crates
///
/// Spawned background tasks (worker loops, lock extenders) can outlive the
/// test that started them; a runtime that persists for the whole suite keeps
/// them from tripping over a shut-down context.
static TEST_RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

/// Global counter for unique fixture names across all test crates
static FIXTURE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Get the shared test runtime (creates on first call, reuses thereafter)
///
/// Workers default to CPU count; override with `TEST_RUNTIME_WORKERS`.
///
/// # Panics
/// Panics if the runtime cannot be created
#[allow(clippy::expect_used)] // Test infrastructure - panic on init failure is acceptable
pub fn get_test_runtime() -> &'static tokio::runtime::Runtime {
    TEST_RUNTIME.get_or_init(|| {
        let workers = std::env::var("TEST_RUNTIME_WORKERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(std::num::NonZero::get)
                    .unwrap_or(4)
            });

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("test-runtime")
            .worker_threads(workers)
            .build()
            .expect("Failed to create test runtime")
    })
}

/// Next value of a counter that is unique across all test crates
pub fn next_fixture_counter() -> usize {
    FIXTURE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Install a test log subscriber once; later calls are no-ops
pub fn init_test_tracing() {
    let _ = repoweaver_common::initialize_tracing("debug", repoweaver_common::LogFormat::Text);
}

/// A non-bare git repository in a temporary directory
///
/// HEAD starts on `main`. The directory is removed when the fixture drops.
pub struct GitFixture {
    repo: Repository,
    dir: TempDir,
}

#[allow(clippy::expect_used)] // Fixture setup failures should abort the test
impl GitFixture {
    /// Create an empty repository whose initial branch is `main`
    ///
    /// # Panics
    /// Panics if the temporary directory or repository cannot be created
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix(&format!("repoweaver-fixture-{}-", next_fixture_counter()))
            .tempdir()
            .expect("Failed to create fixture directory");

        let mut options = RepositoryInitOptions::new();
        options.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &options).expect("Failed to init repository");

        {
            let mut config = repo.config().expect("Failed to open repository config");
            config
                .set_str("user.name", "Fixture")
                .expect("Failed to set user.name");
            config
                .set_str("user.email", "fixture@example.com")
                .expect("Failed to set user.email");
        }

        Self { repo, dir }
    }

    /// Root of the working tree
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `file://` URL pointing at the working tree
    pub fn file_url(&self) -> String {
        format!("file://{}", self.dir.path().display())
    }

    /// Write `file`, stage it and commit on the current branch
    ///
    /// # Panics
    /// Panics if any git operation fails
    pub fn commit(&self, file: &str, contents: &str, message: &str) -> String {
        let full_path: PathBuf = self.dir.path().join(file);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&full_path, contents).expect("Failed to write fixture file");

        let mut index = self.repo.index().expect("Failed to open index");
        index
            .add_path(Path::new(file))
            .expect("Failed to stage fixture file");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = self.repo.find_tree(tree_id).expect("Failed to find tree");

        let signature = Signature::now("Fixture", "fixture@example.com")
            .expect("Failed to create signature");
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .expect("Failed to commit")
            .to_string()
    }

    /// Create a branch pointing at HEAD
    ///
    /// # Panics
    /// Panics if HEAD has no commit or the branch exists
    pub fn branch(&self, name: &str) {
        let head = self.head_commit();
        self.repo
            .branch(name, &head, false)
            .expect("Failed to create branch");
    }

    /// Create a lightweight tag pointing at HEAD
    ///
    /// # Panics
    /// Panics if HEAD has no commit or the tag exists
    pub fn tag(&self, name: &str) {
        let head = self.head_commit();
        self.repo
            .tag_lightweight(name, head.as_object(), false)
            .expect("Failed to create tag");
    }

    /// Point `remote.origin.url` at `url`
    ///
    /// # Panics
    /// Panics if the remote cannot be created
    pub fn set_origin(&self, url: &str) {
        self.repo
            .remote("origin", url)
            .expect("Failed to add origin remote");
    }

    /// Hash of the commit HEAD points at
    ///
    /// # Panics
    /// Panics if HEAD has no commit
    pub fn head_hash(&self) -> String {
        self.head_commit().id().to_string()
    }

    fn head_commit(&self) -> git2::Commit<'_> {
        self.repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .expect("Fixture HEAD has no commit")
    }
}

impl Default for GitFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_is_reusable() {
        let rt1 = get_test_runtime();
        let rt2 = get_test_runtime();

        // Should be same instance
        assert!(std::ptr::eq(rt1, rt2));
    }

    #[test]
    fn test_counter_increments() {
        let start = next_fixture_counter();
        let next = next_fixture_counter();

        assert!(next > start);
    }

    #[test]
    fn test_fixture_commits_on_main() {
        let fixture = GitFixture::new();
        let hash = fixture.commit("src/lib.rs", "fn main() {}", "initial");
        fixture.branch("feature");
        fixture.tag("v1.0");

        assert_eq!(fixture.head_hash(), hash);

        let repo = Repository::open(fixture.path()).ok();
        let head = repo
            .as_ref()
            .and_then(|r| r.head().ok())
            .and_then(|h| h.name().map(str::to_string));
        assert_eq!(head.as_deref(), Some("refs/heads/main"));
    }
}
