//! Turns a claimed job into parsed diff hunks.

use thiserror::Error;
use tracing::info;

use reviewd_core::{parse_unified_diff, DiffHunk, ParseError};

use crate::error::FetchError;
use crate::github::GitHubClient;
use crate::queue::{DiffSource, ReviewJob};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A diff that does not parse will not parse on retry either.
    #[error("malformed diff: {0}")]
    Parse(#[from] ParseError),
}

impl ExtractError {
    pub fn is_terminal(&self) -> bool {
        match self {
            ExtractError::Fetch(err) => err.is_terminal(),
            ExtractError::Parse(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            ExtractError::Fetch(err) => err.retry_after(),
            ExtractError::Parse(_) => None,
        }
    }
}

/// Obtain and parse the diff for a job.
///
/// An empty diff (no hunks) is a valid result; the worker treats it as
/// nothing to review.
pub async fn extract_hunks(
    github: &GitHubClient,
    job: &ReviewJob,
) -> Result<Vec<DiffHunk>, ExtractError> {
    let diff = match &job.source {
        DiffSource::Inline { diff } => diff.clone(),
        DiffSource::Fetch {
            installation_id,
            base_sha,
            ..
        } => {
            github
                .fetch_compare_diff(*installation_id, &job.repo, base_sha, &job.commit_sha)
                .await?
        }
    };

    let hunks = parse_unified_diff(&diff)?;
    info!(
        repo = %job.repo,
        commit = %job.commit_sha,
        hunks = hunks.len(),
        "extracted diff hunks"
    );
    Ok(hunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobId;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn github() -> GitHubClient {
        GitHubClient::new(1, "unused".to_string(), Duration::from_secs(5), 0).unwrap()
    }

    fn inline_job(diff: &str) -> ReviewJob {
        ReviewJob {
            id: JobId(Uuid::new_v4()),
            repo: "o/r".to_string(),
            commit_sha: "abc".to_string(),
            source: DiffSource::Inline {
                diff: diff.to_string(),
            },
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_inline_diff_parses() {
        let diff = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,1 +1,2 @@
 fn main() {}
+// new
";
        let hunks = extract_hunks(&github(), &inline_job(diff)).await.unwrap();
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].file_path, "src/lib.rs");
    }

    #[tokio::test]
    async fn test_empty_diff_yields_no_hunks() {
        let hunks = extract_hunks(&github(), &inline_job("")).await.unwrap();
        assert!(hunks.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_diff_is_terminal() {
        let diff = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ not a hunk header @@
";
        let err = extract_hunks(&github(), &inline_job(diff)).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_rate_limit_hint_survives_wrapping() {
        let err = ExtractError::from(FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        });
        assert!(!err.is_terminal());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }
}
