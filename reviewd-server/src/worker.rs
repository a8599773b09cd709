//! Worker loop: claim a job, fetch and parse the diff, run the review,
//! map comments onto diff positions, persist, and report back.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use reviewd_core::{map_comments, Review};

use crate::extract::extract_hunks;
use crate::queue::{DiffSource, JobOutcome, ReviewJob};
use crate::AppState;

pub async fn worker_loop(state: Arc<AppState>, worker_id: usize) {
    info!(worker_id, "review worker started");
    loop {
        let job = state.queue.dequeue().await;
        info!(
            worker_id,
            job_id = %job.id,
            repo = %job.repo,
            commit = %job.commit_sha,
            attempts = job.attempts,
            "claimed review job"
        );

        let outcome = process_job(&state, &job).await;
        if let JobOutcome::RetryableFailure { error: err, .. } | JobOutcome::TerminalFailure(err) =
            &outcome
        {
            error!(worker_id, job_id = %job.id, error = %err, "review job failed");
        }
        state.queue.complete(job.id, outcome);
    }
}

async fn process_job(state: &AppState, job: &ReviewJob) -> JobOutcome {
    let hunks = match extract_hunks(&state.github, job).await {
        Ok(hunks) => hunks,
        Err(e) if e.is_terminal() => return JobOutcome::TerminalFailure(e.to_string()),
        // The origin's Retry-After hint rides along so the queue can
        // hold the retry back for at least that long.
        Err(e) => {
            return JobOutcome::RetryableFailure {
                retry_after: e.retry_after(),
                error: e.to_string(),
            }
        }
    };

    if hunks.is_empty() {
        info!(
            repo = %job.repo,
            commit = %job.commit_sha,
            "empty diff, nothing to review"
        );
        return JobOutcome::Success;
    }

    let (verdict, from_cache) = match state
        .review_client
        .review_hunks(&job.repo, &job.commit_sha, &hunks)
        .await
    {
        Ok(result) => result,
        Err(e) if e.is_terminal() => return JobOutcome::TerminalFailure(e.to_string()),
        Err(e) => {
            return JobOutcome::RetryableFailure {
                error: e.to_string(),
                retry_after: None,
            }
        }
    };

    // Comments the model anchored outside the diff are dropped here.
    let comments = map_comments(&verdict.comments, &hunks);
    if comments.len() < verdict.comments.len() {
        warn!(
            repo = %job.repo,
            commit = %job.commit_sha,
            dropped = verdict.comments.len() - comments.len(),
            "dropped comments that did not map onto the diff"
        );
    }

    let review = Review {
        id: Uuid::new_v4(),
        repo: job.repo.clone(),
        commit_sha: job.commit_sha.clone(),
        summary: verdict.summary.clone(),
        comments: comments.clone(),
        created_at: Utc::now(),
        model_used: state.review_client.model().to_string(),
    };
    let review_id = review.id;

    if let Err(e) = state.store.append(review).await {
        return JobOutcome::RetryableFailure {
            error: format!("failed to store review: {e}"),
            retry_after: None,
        };
    }

    info!(
        repo = %job.repo,
        commit = %job.commit_sha,
        review_id = %review_id,
        comments = comments.len(),
        from_cache,
        "review stored"
    );

    // Webhook-originated jobs get the verdict posted back to the PR.
    // A posting failure retries the whole job; the fingerprint cache
    // makes the re-run cheap.
    if let DiffSource::Fetch {
        installation_id,
        pr_number: Some(pr_number),
        ..
    } = &job.source
    {
        if let Err(e) = state
            .github
            .post_review(
                *installation_id,
                &job.repo,
                *pr_number,
                &verdict.summary,
                &comments,
            )
            .await
        {
            return JobOutcome::RetryableFailure {
                error: format!("failed to post review: {e:#}"),
                retry_after: None,
            };
        }
    }

    JobOutcome::Success
}
