//! Revision selection for the index builder

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashSet;

/// The index builder accepts at most this many branches and tags per repository
pub const MAX_REVISIONS: usize = 64;

/// Revisions handed to the index builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSet {
    pub revisions: Vec<String>,
    /// Number of distinct revisions before truncation, when truncation happened
    pub truncated_from: Option<usize>,
}

/// Compile case-sensitive globs where `*` does not cross `/`
///
/// Invalid patterns are logged and skipped.
fn compile_globs(patterns: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for pattern in patterns {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
                any = true;
            }
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "Skipping invalid revision glob"),
        }
    }
    if !any {
        return None;
    }
    builder
        .build()
        .inspect_err(|e| tracing::warn!(error = %e, "Failed to build revision globs"))
        .ok()
}

fn matching<'a>(names: &'a [String], globs: Option<&'a [String]>) -> impl Iterator<Item = &'a String> {
    let set = globs.and_then(compile_globs);
    names
        .iter()
        .filter(move |name| set.as_ref().is_some_and(|set| set.is_match(name.as_str())))
}

/// Build the ordered, de-duplicated revision list
///
/// Order is the default branch (`HEAD` when it is unknown), then branches
/// matching `branch_globs` as `refs/heads/*`, then tags matching `tag_globs`
/// as `refs/tags/*`. The list is capped at [`MAX_REVISIONS`].
pub fn build_revisions(
    default_branch: Option<&str>,
    branch_globs: Option<&[String]>,
    branches: &[String],
    tag_globs: Option<&[String]>,
    tags: &[String],
) -> RevisionSet {
    let candidates = std::iter::once(default_branch.unwrap_or("HEAD").to_string())
        .chain(matching(branches, branch_globs).map(|b| format!("refs/heads/{b}")))
        .chain(matching(tags, tag_globs).map(|t| format!("refs/tags/{t}")));

    let mut seen = HashSet::new();
    let mut revisions: Vec<String> = candidates.filter(|r| seen.insert(r.clone())).collect();

    let truncated_from = (revisions.len() > MAX_REVISIONS).then(|| {
        let total = revisions.len();
        revisions.truncate(MAX_REVISIONS);
        total
    });

    RevisionSet {
        revisions,
        truncated_from,
    }
}
