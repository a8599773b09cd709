pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod github;
pub mod limiter;
pub mod openai;
pub mod queue;
pub mod store;
pub mod webhook;
pub mod worker;

use std::sync::Arc;

pub use client::ReviewClient;
pub use github::GitHubClient;
pub use queue::JobQueue;
pub use store::ReviewStore;

pub struct AppState {
    pub webhook_secret: String,
    pub queue: Arc<JobQueue>,
    pub store: ReviewStore,
    pub github: GitHubClient,
    pub review_client: Arc<ReviewClient>,
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    use std::time::Duration;

    use async_trait::async_trait;
    use reviewd_core::{LlmReview, RawComment, Severity};

    use crate::client::CompletionBackend;
    use crate::error::ReviewError;
    use crate::queue::RetryPolicy;

    /// Deterministic backend: one comment on line 2 of src/lib.rs and
    /// one anchored outside any diff.
    struct StubBackend;

    #[async_trait]
    impl CompletionBackend for StubBackend {
        async fn review(
            &self,
            _model: &str,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<LlmReview, ReviewError> {
            Ok(LlmReview {
                summary: "Stub review.".to_string(),
                comments: vec![
                    RawComment {
                        file_path: "src/lib.rs".to_string(),
                        line: 2,
                        severity: Severity::Warning,
                        message: "Check this.".to_string(),
                    },
                    RawComment {
                        file_path: "not/in/diff.rs".to_string(),
                        line: 1,
                        severity: Severity::Info,
                        message: "Ghost comment.".to_string(),
                    },
                ],
            })
        }
    }

    let review_client = ReviewClient::new(
        Arc::new(StubBackend),
        "test-model".to_string(),
        4.0,
        1.0,
        Duration::from_secs(30),
        Duration::from_secs(3600),
    );

    Arc::new(AppState {
        webhook_secret: "test-secret".to_string(),
        queue: Arc::new(JobQueue::new(RetryPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 3,
        })),
        store: ReviewStore::in_memory().expect("in-memory store"),
        github: GitHubClient::new(1, "test-key".to_string(), Duration::from_secs(5), 0)
            .expect("test github client"),
        review_client: Arc::new(review_client),
    })
}
