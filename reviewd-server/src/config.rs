use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::RetryPolicy;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    /// Path of the SQLite review database.
    pub database_path: PathBuf,
    pub port: u16,
    /// Number of worker tasks draining the job queue.
    pub worker_count: usize,
    /// Token bucket size for upstream review calls.
    pub rate_limit_capacity: f64,
    /// Tokens added per second.
    pub rate_limit_refill_per_sec: f64,
    /// How long a review call may wait for a token before failing.
    pub rate_limit_max_wait: Duration,
    /// TTL for cached review responses.
    pub cache_ttl: Duration,
    /// Retry policy for failed jobs.
    pub retry: RetryPolicy,
    /// Per-request timeout for diff fetches.
    pub fetch_timeout: Duration,
    /// Bound on retries of a single diff fetch within one job attempt.
    pub fetch_max_retries: u32,
    /// Timeout for the upstream review call itself.
    pub llm_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let openai_api_key =
            env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable is required")?;

        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .context("DATABASE_PATH environment variable is required")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let worker_count = parse_or_default(env::var("WORKER_COUNT").ok(), 2)?;

        let rate_limit_capacity: f64 =
            parse_or_default(env::var("RATE_LIMIT_CAPACITY").ok(), 4.0)?;
        let rate_limit_refill_per_sec: f64 =
            parse_or_default(env::var("RATE_LIMIT_REFILL_PER_SEC").ok(), 0.5)?;
        let rate_limit_max_wait =
            Duration::from_secs(parse_or_default(env::var("RATE_LIMIT_WAIT_SECS").ok(), 30)?);

        let cache_ttl =
            Duration::from_secs(parse_or_default(env::var("CACHE_TTL_SECS").ok(), 3600)?);

        let retry = RetryPolicy {
            base: Duration::from_secs(parse_or_default(env::var("RETRY_BASE_SECS").ok(), 5)?),
            cap: Duration::from_secs(parse_or_default(env::var("RETRY_CAP_SECS").ok(), 300)?),
            max_attempts: parse_or_default(env::var("MAX_ATTEMPTS").ok(), 5)?,
        };

        let fetch_timeout =
            Duration::from_secs(parse_or_default(env::var("FETCH_TIMEOUT_SECS").ok(), 30)?);
        let fetch_max_retries = parse_or_default(env::var("FETCH_MAX_RETRIES").ok(), 3)?;
        let llm_timeout =
            Duration::from_secs(parse_or_default(env::var("LLM_TIMEOUT_SECS").ok(), 120)?);

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            openai_api_key,
            openai_model,
            database_path,
            port,
            worker_count,
            rate_limit_capacity,
            rate_limit_refill_per_sec,
            rate_limit_max_wait,
            cache_ttl,
            retry,
            fetch_timeout,
            fetch_max_retries,
            llm_timeout,
        })
    }
}

/// Parse an optional environment value, falling back to a default when
/// the variable is unset. A set-but-unparseable value is an error, not
/// a silent fallback.
fn parse_or_default<T: std::str::FromStr>(value: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid configuration value {:?}: {}", raw, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_default_unset_uses_default() {
        assert_eq!(parse_or_default::<u32>(None, 5).unwrap(), 5);
    }

    #[test]
    fn test_parse_or_default_set_parses() {
        assert_eq!(parse_or_default::<u32>(Some("12".to_string()), 5).unwrap(), 12);
        assert_eq!(
            parse_or_default::<f64>(Some("0.25".to_string()), 1.0).unwrap(),
            0.25
        );
    }

    #[test]
    fn test_parse_or_default_garbage_is_an_error() {
        // A misconfigured value must fail startup, not silently fall
        // back to the default.
        assert!(parse_or_default::<u32>(Some("three".to_string()), 5).is_err());
    }
}
