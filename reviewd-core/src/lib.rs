//! Core domain logic for the review pipeline: diff parsing, position
//! mapping, fingerprinting, and the review data model. No I/O lives in
//! this crate.

pub mod diff;
pub mod fingerprint;
pub mod position;
pub mod review;

pub use diff::{parse_unified_diff, DiffHunk, DiffLine, LineKind, ParseError};
pub use fingerprint::fingerprint;
pub use position::{map_comments, new_line_for_position, position_for_new_line};
pub use review::{build_user_prompt, system_prompt, LlmReview, RawComment, Review, ReviewComment, Severity};
