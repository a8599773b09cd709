//! Unified-diff parsing.
//!
//! Turns the raw diff text returned by the GitHub compare API into
//! per-file hunks with addressable old/new line numbers. Parsing is
//! strict about hunk headers: a header that does not match
//! `@@ -old_start,old_lines +new_start,new_lines @@` is an error rather
//! than a silently skipped region, since downstream position mapping
//! depends on the declared offsets being correct.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed hunk header at line {line}: {header:?}")]
    MalformedHunkHeader { line: usize, header: String },
    #[error("hunk header at line {line} appears before any file header")]
    HunkWithoutFile { line: usize },
    #[error("hunk starting at line {line} is truncated (declared counts not satisfied)")]
    TruncatedHunk { line: usize },
}

/// Kind of a single diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Context,
    Add,
    Del,
}

/// One line of a hunk, with the line numbers it occupies on each side.
///
/// `old_line_no` is `None` for added lines; `new_line_no` is `None` for
/// deleted lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: LineKind,
    pub old_line_no: Option<u32>,
    pub new_line_no: Option<u32>,
    pub text: String,
}

/// A contiguous changed region of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub file_path: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Reconstruct the hunk as it appears in a unified diff, header
    /// included. This is the canonical form hashed by fingerprinting.
    pub fn canonical_text(&self) -> String {
        let mut out = format!(
            "--- a/{path}\n+++ b/{path}\n@@ -{},{} +{},{} @@\n",
            self.old_start,
            self.old_lines,
            self.new_start,
            self.new_lines,
            path = self.file_path
        );
        for line in &self.lines {
            let prefix = match line.kind {
                LineKind::Context => ' ',
                LineKind::Add => '+',
                LineKind::Del => '-',
            };
            out.push(prefix);
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}

/// Parse `@@ -old_start[,old_lines] +new_start[,new_lines] @@ ...`.
///
/// An omitted count means 1, per the unified diff format.
fn parse_hunk_header(header: &str) -> Option<(u32, u32, u32, u32)> {
    let rest = header.strip_prefix("@@ -")?;
    let end = rest.find(" @@")?;
    let ranges = &rest[..end];
    let (old_range, new_range) = ranges.split_once(" +")?;

    fn parse_range(range: &str) -> Option<(u32, u32)> {
        match range.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((range.parse().ok()?, 1)),
        }
    }

    let (old_start, old_lines) = parse_range(old_range)?;
    let (new_start, new_lines) = parse_range(new_range)?;
    Some((old_start, old_lines, new_start, new_lines))
}

/// Strip the `a/` or `b/` prefix git puts on diff paths.
fn strip_git_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Parse a unified diff into hunks.
///
/// File identity is taken from the `+++` header (the post-image path),
/// falling back to the `---` header for deletions where the post-image
/// is `/dev/null`. Non-hunk metadata lines (`index`, mode changes,
/// `Binary files ... differ`) are skipped.
pub fn parse_unified_diff(diff: &str) -> Result<Vec<DiffHunk>, ParseError> {
    let mut hunks = Vec::new();
    let mut current_file: Option<String> = None;
    let mut old_path: Option<String> = None;

    let mut lines = diff.lines().enumerate().peekable();

    while let Some((idx, line)) = lines.next() {
        let line_no = idx + 1;

        if line.starts_with("diff --git ") {
            current_file = None;
            old_path = None;
            continue;
        }
        if let Some(path) = line.strip_prefix("--- ") {
            old_path = Some(strip_git_prefix(path).to_string());
            continue;
        }
        if let Some(path) = line.strip_prefix("+++ ") {
            current_file = if path == "/dev/null" {
                old_path.clone()
            } else {
                Some(strip_git_prefix(path).to_string())
            };
            continue;
        }
        if !line.starts_with("@@") {
            // index lines, mode changes, binary markers, etc.
            continue;
        }

        let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(line)
            .ok_or_else(|| ParseError::MalformedHunkHeader {
                line: line_no,
                header: line.to_string(),
            })?;
        let file_path = current_file
            .clone()
            .ok_or(ParseError::HunkWithoutFile { line: line_no })?;

        let mut hunk = DiffHunk {
            file_path,
            old_start,
            old_lines,
            new_start,
            new_lines,
            lines: Vec::new(),
        };

        let mut remaining_old = old_lines;
        let mut remaining_new = new_lines;
        let mut old_no = old_start;
        let mut new_no = new_start;

        while remaining_old > 0 || remaining_new > 0 {
            let Some(&(_, body)) = lines.peek() else {
                return Err(ParseError::TruncatedHunk { line: line_no });
            };

            if body.starts_with('\\') {
                // "\ No newline at end of file" does not count toward
                // either side.
                lines.next();
                continue;
            }

            let (kind, text) = match body.chars().next() {
                Some(' ') => (LineKind::Context, &body[1..]),
                Some('+') => (LineKind::Add, &body[1..]),
                Some('-') => (LineKind::Del, &body[1..]),
                // An entirely empty line inside a hunk is a context line
                // whose content is empty (trailing whitespace stripped in
                // transit).
                None => (LineKind::Context, ""),
                _ => return Err(ParseError::TruncatedHunk { line: line_no }),
            };

            let (old_line_no, new_line_no) = match kind {
                LineKind::Context => {
                    if remaining_old == 0 || remaining_new == 0 {
                        return Err(ParseError::TruncatedHunk { line: line_no });
                    }
                    remaining_old -= 1;
                    remaining_new -= 1;
                    let nos = (Some(old_no), Some(new_no));
                    old_no += 1;
                    new_no += 1;
                    nos
                }
                LineKind::Del => {
                    if remaining_old == 0 {
                        return Err(ParseError::TruncatedHunk { line: line_no });
                    }
                    remaining_old -= 1;
                    let nos = (Some(old_no), None);
                    old_no += 1;
                    nos
                }
                LineKind::Add => {
                    if remaining_new == 0 {
                        return Err(ParseError::TruncatedHunk { line: line_no });
                    }
                    remaining_new -= 1;
                    let nos = (None, Some(new_no));
                    new_no += 1;
                    nos
                }
            };

            hunk.lines.push(DiffLine {
                kind,
                old_line_no,
                new_line_no,
                text: text.to_string(),
            });
            lines.next();
        }

        // A trailing no-newline marker belongs to the hunk we just closed.
        if let Some(&(_, body)) = lines.peek() {
            if body.starts_with('\\') {
                lines.next();
            }
        }

        hunks.push(hunk);
    }

    Ok(hunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_DIFF: &str = "\
diff --git a/foo.py b/foo.py
index 1234567..89abcde 100644
--- a/foo.py
+++ b/foo.py
@@ -1,3 +1,4 @@
 def main():
-    print(\"hello\")
+    print(\"hello world\")
+    return 0
 main()
";

    #[test]
    fn test_parse_simple_diff() {
        let hunks = parse_unified_diff(SIMPLE_DIFF).unwrap();
        assert_eq!(hunks.len(), 1);

        let hunk = &hunks[0];
        assert_eq!(hunk.file_path, "foo.py");
        assert_eq!(hunk.old_start, 1);
        assert_eq!(hunk.old_lines, 3);
        assert_eq!(hunk.new_start, 1);
        assert_eq!(hunk.new_lines, 4);
        assert_eq!(hunk.lines.len(), 5);
    }

    #[test]
    fn test_line_numbering() {
        let hunks = parse_unified_diff(SIMPLE_DIFF).unwrap();
        let lines = &hunks[0].lines;

        // " def main():" occupies line 1 on both sides
        assert_eq!(lines[0].kind, LineKind::Context);
        assert_eq!(lines[0].old_line_no, Some(1));
        assert_eq!(lines[0].new_line_no, Some(1));

        // deletion has no new line number
        assert_eq!(lines[1].kind, LineKind::Del);
        assert_eq!(lines[1].old_line_no, Some(2));
        assert_eq!(lines[1].new_line_no, None);

        // additions have no old line number
        assert_eq!(lines[2].kind, LineKind::Add);
        assert_eq!(lines[2].old_line_no, None);
        assert_eq!(lines[2].new_line_no, Some(2));
        assert_eq!(lines[3].new_line_no, Some(3));

        // trailing context is shifted on the new side
        assert_eq!(lines[4].kind, LineKind::Context);
        assert_eq!(lines[4].old_line_no, Some(3));
        assert_eq!(lines[4].new_line_no, Some(4));
    }

    #[test]
    fn test_parse_multiple_files() {
        let diff = "\
diff --git a/a.rs b/a.rs
--- a/a.rs
+++ b/a.rs
@@ -1 +1 @@
-old
+new
diff --git a/b.rs b/b.rs
--- a/b.rs
+++ b/b.rs
@@ -5,2 +5,3 @@
 ctx
+added
 ctx2
";
        let hunks = parse_unified_diff(diff).unwrap();
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].file_path, "a.rs");
        assert_eq!(hunks[1].file_path, "b.rs");
        assert_eq!(hunks[1].lines[1].new_line_no, Some(6));
    }

    #[test]
    fn test_omitted_count_means_one() {
        let diff = "\
--- a/x
+++ b/x
@@ -1 +1 @@
-a
+b
";
        let hunks = parse_unified_diff(diff).unwrap();
        assert_eq!(hunks[0].old_lines, 1);
        assert_eq!(hunks[0].new_lines, 1);
    }

    #[test]
    fn test_deleted_file_uses_old_path() {
        let diff = "\
diff --git a/gone.txt b/gone.txt
--- a/gone.txt
+++ /dev/null
@@ -1,2 +0,0 @@
-first
-second
";
        let hunks = parse_unified_diff(diff).unwrap();
        assert_eq!(hunks[0].file_path, "gone.txt");
        assert_eq!(hunks[0].lines.len(), 2);
        assert!(hunks[0].lines.iter().all(|l| l.kind == LineKind::Del));
    }

    #[test]
    fn test_no_newline_marker_ignored() {
        let diff = "\
--- a/x
+++ b/x
@@ -1 +1 @@
-old
\\ No newline at end of file
+new
\\ No newline at end of file
";
        let hunks = parse_unified_diff(diff).unwrap();
        assert_eq!(hunks[0].lines.len(), 2);
    }

    #[test]
    fn test_malformed_hunk_header() {
        let diff = "\
--- a/x
+++ b/x
@@ -1,bogus +1 @@
-a
+b
";
        let err = parse_unified_diff(diff).unwrap_err();
        assert!(matches!(err, ParseError::MalformedHunkHeader { line: 3, .. }));
    }

    #[test]
    fn test_hunk_before_any_file_header() {
        let diff = "@@ -1 +1 @@\n-a\n+b\n";
        let err = parse_unified_diff(diff).unwrap_err();
        assert!(matches!(err, ParseError::HunkWithoutFile { line: 1 }));
    }

    #[test]
    fn test_truncated_hunk() {
        let diff = "\
--- a/x
+++ b/x
@@ -1,3 +1,3 @@
 only one line
";
        let err = parse_unified_diff(diff).unwrap_err();
        assert!(matches!(err, ParseError::TruncatedHunk { .. }));
    }

    #[test]
    fn test_empty_diff_yields_no_hunks() {
        assert_eq!(parse_unified_diff("").unwrap(), Vec::new());
    }

    #[test]
    fn test_canonical_text_round_trips_through_parser() {
        let hunks = parse_unified_diff(SIMPLE_DIFF).unwrap();
        let reparsed = parse_unified_diff(&hunks[0].canonical_text()).unwrap();
        assert_eq!(reparsed, hunks);
    }
}
