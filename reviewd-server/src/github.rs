//! GitHub App API client.
//!
//! Authentication is the standard App flow: a short-lived RS256 JWT
//! signed with the App's private key is exchanged for an installation
//! access token, which is cached per installation until close to its
//! expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use reviewd_core::ReviewComment;

use crate::error::FetchError;

const API_BASE: &str = "https://api.github.com";

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
    api_base: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
struct ReviewRequest {
    body: String,
    event: &'static str,
    comments: Vec<ReviewRequestComment>,
}

#[derive(Debug, Serialize)]
struct ReviewRequestComment {
    path: String,
    position: u32,
    body: String,
}

impl GitHubClient {
    pub fn new(
        app_id: u64,
        private_key: String,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("reviewd")
            .build()
            .context("Failed to build GitHub HTTP client")?;

        Ok(Self {
            client,
            app_id,
            private_key,
            api_base: API_BASE.to_string(),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            max_retries,
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Reuse a cached token as long as it has at least 5 minutes left.
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(expires_at.timestamp() as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    /// Fetch the comparison between two commits as a unified diff.
    ///
    /// Transient failures are retried in place with a short linear
    /// delay; terminal conditions (the comparison no longer exists)
    /// and origin rate limits are surfaced to the caller.
    pub async fn fetch_compare_diff(
        &self,
        installation_id: u64,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self
                .fetch_compare_diff_once(installation_id, repo, base_sha, head_sha)
                .await
            {
                Ok(diff) => return Ok(diff),
                Err(err @ FetchError::Transient(_)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        repo,
                        attempt,
                        error = %err,
                        "transient diff fetch failure, retrying"
                    );
                    tokio::time::sleep(transient_retry_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_compare_diff_once(
        &self,
        installation_id: u64,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<String, FetchError> {
        let token = self
            .get_installation_token(installation_id)
            .await
            .map_err(|e| FetchError::Transient(format!("token exchange failed: {e:#}")))?;

        let url = format!(
            "{}/repos/{}/compare/{}...{}",
            self.api_base, repo, base_sha, head_sha
        );
        info!(repo, "Fetching diff from {}...{}", base_sha, head_sha);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3.diff")
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("diff request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "GitHub API error fetching diff: {} - {}",
                status, error_text
            );
            return Err(fetch_error_from_status(status, retry_after, error_text));
        }

        let diff = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("failed to read diff body: {e}")))?;
        info!("Successfully fetched diff ({} bytes)", diff.len());

        Ok(diff)
    }

    /// Post the review back to the pull request: a summary body plus
    /// positioned inline comments, as a single non-blocking review.
    pub async fn post_review(
        &self,
        installation_id: u64,
        repo: &str,
        pr_number: u64,
        summary: &str,
        comments: &[ReviewComment],
    ) -> Result<()> {
        let url = format!("{}/repos/{}/pulls/{}/reviews", self.api_base, repo, pr_number);

        info!(
            "Posting review with {} comments to PR #{} in {}",
            comments.len(),
            pr_number,
            repo
        );

        let token = self.get_installation_token(installation_id).await?;
        let request_body = ReviewRequest {
            body: summary.to_string(),
            event: "COMMENT",
            comments: comments
                .iter()
                .map(|c| ReviewRequestComment {
                    path: c.file_path.clone(),
                    position: c.position,
                    body: format!("**{}**: {}", c.severity.as_str(), c.message),
                })
                .collect(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&request_body)
            .send()
            .await
            .context("Failed to send review request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error posting review: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub API error posting review: {} - {}",
                status,
                error_text
            ));
        }

        info!("Successfully posted review to PR #{}", pr_number);
        Ok(())
    }
}

/// Delay before in-attempt transient retry `attempt` (1-based): doubles
/// from 2s, capped at 60s.
fn transient_retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(60))
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn fetch_error_from_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    error_text: String,
) -> FetchError {
    match status {
        // Force-pushed-away commits come back as 404 or 422 from the
        // compare endpoint.
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => FetchError::NotFound,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::RateLimited { retry_after }
        }
        _ => FetchError::Transient(format!("{} - {}", status, error_text)),
    }
}
