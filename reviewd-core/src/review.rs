//! Review data model and prompt construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::diff::DiffHunk;

/// Severity attached to a review comment.
///
/// Unknown values from the model are folded into `Info` rather than
/// rejecting the whole response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Severity::from_str_lossy(&s))
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "warning" => Severity::Warning,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

/// A comment as returned by the model: anchored to a new-file line
/// number, not yet validated against the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawComment {
    pub file_path: String,
    pub line: u32,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    pub message: String,
}

fn default_severity() -> Severity {
    Severity::Info
}

/// The parsed model response for one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmReview {
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<RawComment>,
}

/// A comment anchored to an exact diff position.
///
/// `position` is the hunk-relative offset within the file's diff (see
/// `crate::position`); `old_line_no`/`new_line_no` are the file line
/// numbers on each side where applicable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub file_path: String,
    pub position: u32,
    pub old_line_no: Option<u32>,
    pub new_line_no: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

/// A finalized review. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub repo: String,
    pub commit_sha: String,
    pub summary: String,
    pub comments: Vec<ReviewComment>,
    pub created_at: DateTime<Utc>,
    pub model_used: String,
}

/// Fixed system prompt for the review model.
pub fn system_prompt() -> &'static str {
    "You are a precise code review assistant. Review the diff hunks and \
     return a JSON object with a concise summary and a list of comments. \
     Focus on correctness, security, performance, and maintainability. \
     Avoid style-only notes unless they prevent bugs.\n\n\
     Return JSON with this schema:\n\
     {\n\
       \"summary\": \"string\",\n\
       \"comments\": [\n\
         {\"file_path\": \"string\", \"line\": int, \"severity\": \"info|warning|critical\", \"message\": \"string\"}\n\
       ]\n\
     }\n\
     `line` is the line number in the file after the change was applied. \
     Only comment on lines that appear in the hunks."
}

/// Build the user prompt from the diff hunks.
pub fn build_user_prompt(repo: &str, commit_sha: &str, hunks: &[DiffHunk]) -> String {
    let mut prompt = format!(
        "Repository: {}\nCommit: {}\n\nDiff hunks follow.\n",
        repo, commit_sha
    );

    for hunk in hunks {
        prompt.push_str("\nHUNK BEGINS:\n");
        prompt.push_str(&hunk.canonical_text());
        prompt.push_str("HUNK ENDS\n");
    }

    prompt
}
