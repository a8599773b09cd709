//! Operator-facing HTTP API: stored reviews, queue state, health.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::ReviewFilter;
use crate::queue::{DiffSource, EnqueueOutcome, JobId, JobSnapshot, JobSpec};
use crate::AppState;

use reviewd_core::Review;

#[derive(Debug, Deserialize, Default)]
pub struct ReviewQuery {
    pub repo: Option<String>,
    pub commit_sha: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitReviewRequest {
    pub repo: String,
    pub commit_sha: String,
    pub diff: String,
}

#[derive(Serialize)]
pub struct SubmitReviewResponse {
    pub message: String,
    pub job_id: JobId,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "reviewd",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_reviews(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Vec<Review>>, StatusCode> {
    let filter = ReviewFilter {
        repo: query.repo,
        commit_sha: query.commit_sha,
        limit: query.limit,
        offset: query.offset,
    };

    match state.store.list(filter).await {
        Ok(reviews) => Ok(Json(reviews)),
        Err(e) => {
            error!("Failed to list reviews: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Review>, StatusCode> {
    match state.store.get(id).await {
        Ok(Some(review)) => Ok(Json(review)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to load review {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Manual submission: review a diff supplied inline, without waiting
/// for a webhook. Useful for backfills and local testing.
async fn submit_review(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitReviewRequest>,
) -> Result<(StatusCode, Json<SubmitReviewResponse>), StatusCode> {
    if request.repo.is_empty() || request.commit_sha.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    info!(
        repo = %request.repo,
        commit = %request.commit_sha,
        "manual review submission"
    );

    let outcome = state.queue.enqueue(JobSpec {
        repo: request.repo,
        commit_sha: request.commit_sha,
        source: DiffSource::Inline { diff: request.diff },
    });

    let message = match outcome {
        EnqueueOutcome::Created(_) => "review queued",
        EnqueueOutcome::Updated(_) => "review updated",
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitReviewResponse {
            message: message.to_string(),
            job_id: outcome.job_id(),
        }),
    ))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobSnapshot>> {
    Json(state.queue.snapshot())
}

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/reviews", get(list_reviews).post(submit_review))
        .route("/api/reviews/:id", get(get_review))
        .route("/api/jobs", get(list_jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use reviewd_core::{ReviewComment, Severity};
    use tower::ServiceExt;

    async fn call(
        state: Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let app = api_router().with_state(state);
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn sample_review(repo: &str, sha: &str) -> Review {
        Review {
            id: Uuid::new_v4(),
            repo: repo.to_string(),
            commit_sha: sha.to_string(),
            summary: "Looks fine.".to_string(),
            comments: vec![ReviewComment {
                file_path: "src/lib.rs".to_string(),
                position: 2,
                old_line_no: None,
                new_line_no: Some(3),
                severity: Severity::Info,
                message: "Nit.".to_string(),
            }],
            created_at: Utc::now(),
            model_used: "gpt-4o-mini".to_string(),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let state = crate::test_state();
        let (status, body) = call(state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_list_and_filter_reviews() {
        let state = crate::test_state();
        state.store.append(sample_review("o/a", "sha1")).await.unwrap();
        state.store.append(sample_review("o/b", "sha2")).await.unwrap();

        let (status, body) = call(state.clone(), "GET", "/api/reviews", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = call(state, "GET", "/api/reviews?repo=o/a", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["repo"], "o/a");
    }

    #[tokio::test]
    async fn test_get_review_by_id() {
        let state = crate::test_state();
        let review = sample_review("o/r", "abc");
        state.store.append(review.clone()).await.unwrap();

        let (status, body) =
            call(state.clone(), "GET", &format!("/api/reviews/{}", review.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["commit_sha"], "abc");
        assert_eq!(body["comments"][0]["severity"], "info");

        let (status, _) = call(
            state,
            "GET",
            &format!("/api/reviews/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_inline_review() {
        let state = crate::test_state();
        let (status, body) = call(
            state.clone(),
            "POST",
            "/api/reviews",
            Some(json!({
                "repo": "o/r",
                "commit_sha": "abc",
                "diff": "--- a/f\n+++ b/f\n@@ -1,1 +1,2 @@\n x\n+y\n"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "review queued");

        let snapshot = state.queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].repo, "o/r");
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_repo() {
        let state = crate::test_state();
        let (status, _) = call(
            state,
            "POST",
            "/api/reviews",
            Some(json!({"repo": "", "commit_sha": "abc", "diff": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_jobs_snapshot() {
        let state = crate::test_state();
        state.queue.enqueue(JobSpec {
            repo: "o/r".to_string(),
            commit_sha: "abc".to_string(),
            source: DiffSource::Inline {
                diff: String::new(),
            },
        });

        let (status, body) = call(state, "GET", "/api/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["state"], "queued");
        assert_eq!(body[0]["attempts"], 0);
    }
}
