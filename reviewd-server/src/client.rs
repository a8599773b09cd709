//! Rate-limited, cached review client.
//!
//! Wraps the raw completion backend with the three protections the
//! pipeline needs: a token bucket so workers cannot stampede the
//! upstream, a TTL cache keyed by diff fingerprint, and single-flight
//! so concurrent requests for the same fingerprint produce one
//! upstream call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use reviewd_core::{build_user_prompt, fingerprint, system_prompt, DiffHunk, LlmReview};

use crate::cache::ReviewCache;
use crate::error::ReviewError;
use crate::limiter::TokenBucket;
use crate::openai::OpenAiClient;

/// The upstream completion call, behind a trait so tests can stub it.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn review(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmReview, ReviewError>;
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn review(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmReview, ReviewError> {
        OpenAiClient::review(self, model, system_prompt, user_prompt).await
    }
}

pub struct ReviewClient {
    backend: Arc<dyn CompletionBackend>,
    limiter: TokenBucket,
    cache: ReviewCache,
    model: String,
    max_wait: Duration,
}

impl ReviewClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: String,
        capacity: f64,
        refill_per_sec: f64,
        max_wait: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            limiter: TokenBucket::new(capacity, refill_per_sec),
            cache: ReviewCache::new(cache_ttl),
            model,
            max_wait,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Review a set of diff hunks, returning the verdict and whether it
    /// came from the cache.
    pub async fn review_hunks(
        &self,
        repo: &str,
        commit_sha: &str,
        hunks: &[DiffHunk],
    ) -> Result<(LlmReview, bool), ReviewError> {
        let key = fingerprint(&self.model, hunks);

        if let Some(review) = self.cache.get(&key) {
            info!(repo, commit_sha, "review served from cache");
            return Ok((review, true));
        }

        // Single-flight: concurrent callers for the same fingerprint
        // queue behind one upstream request.
        let flight = self.cache.flight_lock(&key).await;
        let _guard = flight.lock().await;

        // A caller that held the lock before us may have filled the
        // cache while we waited.
        if let Some(review) = self.cache.get(&key) {
            info!(repo, commit_sha, "review served from cache after flight wait");
            return Ok((review, true));
        }

        self.limiter.acquire(self.max_wait).await?;

        let user_prompt = build_user_prompt(repo, commit_sha, hunks);
        let review = self
            .backend
            .review(&self.model, system_prompt(), &user_prompt)
            .await?;

        self.cache.insert(key, review.clone());
        Ok((review, false))
    }
}
