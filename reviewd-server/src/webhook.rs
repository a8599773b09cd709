use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::AuthError;
use crate::queue::{DiffSource, EnqueueOutcome, JobId, JobSpec};
use crate::AppState;

/// Pull request actions that trigger a review.
const REVIEWED_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    // Push event fields.
    pub before: Option<String>,
    pub after: Option<String>,
    pub deleted: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// A verified webhook payload reduced to the cases the pipeline acts on.
#[derive(Debug)]
enum NormalizedEvent {
    PullRequest {
        number: u64,
        head_sha: String,
        base_sha: String,
        repo: String,
        installation_id: u64,
    },
    Push {
        before: String,
        after: String,
        repo: String,
        installation_id: u64,
    },
    /// Acknowledged and dropped; carries the reason for the log line.
    Ignored(String),
}

fn normalize_event(
    event: &str,
    payload: GitHubWebhookPayload,
) -> Result<NormalizedEvent, StatusCode> {
    match event {
        "pull_request" => {
            let action = payload.action.as_deref().unwrap_or_default();
            if !REVIEWED_ACTIONS.contains(&action) {
                return Ok(NormalizedEvent::Ignored(format!("action: {}", action)));
            }
            let Some(pr) = payload.pull_request else {
                warn!("pull_request event without pull request body");
                return Err(StatusCode::BAD_REQUEST);
            };
            let Some(repo) = payload.repository else {
                warn!("pull_request event without repository");
                return Err(StatusCode::BAD_REQUEST);
            };
            let Some(installation) = payload.installation else {
                warn!("pull_request event without installation, cannot authenticate fetches");
                return Err(StatusCode::BAD_REQUEST);
            };
            Ok(NormalizedEvent::PullRequest {
                number: pr.number,
                head_sha: pr.head.sha,
                base_sha: pr.base.sha,
                repo: repo.full_name,
                installation_id: installation.id,
            })
        }
        "push" => {
            // Branch deletions carry a zero `after` sha; there is no
            // commit to review.
            if payload.deleted == Some(true) {
                return Ok(NormalizedEvent::Ignored("branch deletion push".to_string()));
            }
            let (Some(before), Some(after)) = (payload.before, payload.after) else {
                warn!("push event without before/after shas");
                return Err(StatusCode::BAD_REQUEST);
            };
            if after.chars().all(|c| c == '0') {
                return Ok(NormalizedEvent::Ignored("branch deletion push".to_string()));
            }
            let Some(repo) = payload.repository else {
                warn!("push event without repository");
                return Err(StatusCode::BAD_REQUEST);
            };
            let Some(installation) = payload.installation else {
                warn!("push event without installation, cannot authenticate fetches");
                return Err(StatusCode::BAD_REQUEST);
            };
            Ok(NormalizedEvent::Push {
                before,
                after,
                repo: repo.full_name,
                installation_id: installation.id,
            })
        }
        other => Ok(NormalizedEvent::Ignored(format!("event: {}", other))),
    }
}

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> Result<(), AuthError> {
    let signature_hex = signature
        .strip_prefix("sha256=")
        .ok_or(AuthError::InvalidSignature)?;

    let signature_bytes = hex::decode(signature_hex).map_err(|_| AuthError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::InvalidSignature)?;
    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes)
        .map_err(|_| AuthError::InvalidSignature)
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            error!("Webhook rejected: {}", AuthError::MissingHeader);
            StatusCode::UNAUTHORIZED
        })?;

    if let Err(err) = verify_github_signature(&state.webhook_secret, &bytes, signature) {
        // Log the reason but never echo it to the sender.
        error!("Webhook rejected: {}", err);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<WebhookResponse>), StatusCode> {
    let event = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let payload: GitHubWebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    // Enqueue only; the diff is fetched when a worker claims the job,
    // so the handler stays fast and always sees the latest payload.
    let spec = match normalize_event(&event, payload)? {
        // Unrecognized events and actions are acknowledged, not
        // treated as errors.
        NormalizedEvent::Ignored(reason) => {
            info!(%event, %reason, "Ignoring webhook delivery");
            return Ok((
                StatusCode::ACCEPTED,
                Json(WebhookResponse {
                    message: format!("ignored {}", reason),
                    job_id: None,
                }),
            ));
        }
        NormalizedEvent::PullRequest {
            number,
            head_sha,
            base_sha,
            repo,
            installation_id,
        } => {
            info!("PR #{} in {}, head {}", number, repo, head_sha);
            JobSpec {
                repo,
                commit_sha: head_sha,
                source: DiffSource::Fetch {
                    installation_id,
                    pr_number: Some(number),
                    base_sha,
                },
            }
        }
        NormalizedEvent::Push {
            before,
            after,
            repo,
            installation_id,
        } => {
            info!("Push to {}, {}..{}", repo, before, after);
            JobSpec {
                repo,
                commit_sha: after,
                source: DiffSource::Fetch {
                    installation_id,
                    pr_number: None,
                    base_sha: before,
                },
            }
        }
    };

    let outcome = state.queue.enqueue(spec);

    let message = match outcome {
        EnqueueOutcome::Created(_) => "review queued",
        EnqueueOutcome::Updated(_) => "review updated",
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            message: message.to_string(),
            job_id: Some(outcome.job_id()),
        }),
    ))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/github", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
