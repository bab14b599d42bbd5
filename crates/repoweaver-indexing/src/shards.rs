//! Index shard file layout
//!
//! The index builder writes `<org_id>_<repo_id>_v16.00000.zoekt` style shards
//! into the index directory, staging them as `*.tmp` files first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Prefix shared by every shard of one repository
pub fn shard_prefix(org_id: i32, repo_id: i64) -> String {
    format!("{org_id}_{repo_id}")
}

/// True when `file_name` belongs to the repository with shard `prefix`
///
/// The separator after the prefix keeps repo 1 from matching repo 10's shards.
fn belongs_to(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('_') || rest.starts_with('.'))
}

async fn delete_matching<F>(index_dir: &Path, matches: F) -> std::io::Result<Vec<PathBuf>>
where
    F: Fn(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(index_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut deleted = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches(name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => deleted.push(path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    deleted.sort();
    Ok(deleted)
}

/// Delete every shard of the repository, returning the removed paths
pub async fn delete_shards(index_dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    delete_matching(index_dir, |name| belongs_to(name, prefix)).await
}

/// Delete partially written shards left by a failed build
pub async fn delete_temp_shards(index_dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    delete_matching(index_dir, |name| {
        belongs_to(name, prefix) && name.ends_with(".tmp")
    })
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"shard").unwrap();
    }

    fn remaining(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_delete_shards_removes_exactly_the_repository() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "1_1_v16.00000.zoekt");
        touch(dir.path(), "1_1_v16.00001.zoekt");
        touch(dir.path(), "1_10_v16.00000.zoekt");
        touch(dir.path(), "2_1_v16.00000.zoekt");
        touch(dir.path(), "11_1_v16.00000.zoekt");

        let deleted = delete_shards(dir.path(), &shard_prefix(1, 1)).await.unwrap();

        assert_eq!(deleted.len(), 2);
        assert_eq!(
            remaining(dir.path()),
            vec![
                "11_1_v16.00000.zoekt".to_string(),
                "1_10_v16.00000.zoekt".to_string(),
                "2_1_v16.00000.zoekt".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_temp_shards_keeps_finished_shards() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "1_5_v16.00000.zoekt");
        touch(dir.path(), "1_5_v16.00000.zoekt123456.tmp");

        let deleted = delete_temp_shards(dir.path(), "1_5").await.unwrap();

        assert_eq!(deleted.len(), 1);
        assert_eq!(remaining(dir.path()), vec!["1_5_v16.00000.zoekt".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_index_dir_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let deleted = delete_shards(&dir.path().join("missing"), "1_1").await.unwrap();
        assert!(deleted.is_empty());
    }
}
