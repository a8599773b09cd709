//! Mapping model comments onto diff positions.
//!
//! A "position" is the GitHub review-comment convention: per file, the
//! first line of the first hunk is position 1, every subsequent hunk
//! line increments the counter, and each later hunk header consumes one
//! position of its own. Comments that reference a line not present in
//! the diff are dropped; a position is never fabricated.

use crate::diff::{DiffHunk, DiffLine};
use crate::review::{RawComment, ReviewComment};

/// Walk all hunk lines of one file in diff order, yielding each line
/// with the position it occupies.
fn walk_file_positions<'a>(hunks: &'a [DiffHunk], file_path: &str) -> Vec<(u32, &'a DiffLine)> {
    let mut out = Vec::new();
    let mut position = 0u32;
    for (hunk_idx, hunk) in hunks
        .iter()
        .filter(|h| h.file_path == file_path)
        .enumerate()
    {
        if hunk_idx > 0 {
            // Subsequent hunk headers consume a position.
            position += 1;
        }
        for line in &hunk.lines {
            position += 1;
            out.push((position, line));
        }
    }
    out
}

/// Find the position of a new-file line within the file's hunks.
///
/// Deleted lines are not addressable by new-file line number, so only
/// context and added lines can match.
pub fn position_for_new_line(
    hunks: &[DiffHunk],
    file_path: &str,
    new_line: u32,
) -> Option<(u32, DiffLine)> {
    walk_file_positions(hunks, file_path)
        .into_iter()
        .find(|(_, line)| line.new_line_no == Some(new_line))
        .map(|(pos, line)| (pos, line.clone()))
}

/// Inverse of [`position_for_new_line`]: recover the new-file line
/// number at a given position, if that position holds a line with a
/// new-side number.
pub fn new_line_for_position(hunks: &[DiffHunk], file_path: &str, position: u32) -> Option<u32> {
    walk_file_positions(hunks, file_path)
        .into_iter()
        .find(|(pos, _)| *pos == position)
        .and_then(|(_, line)| line.new_line_no)
}

/// Map raw model comments onto exact diff positions.
///
/// Unmappable comments (line outside every hunk for the file, or an
/// unknown file) are silently dropped. The result is stably sorted by
/// `(file_path, position)` so identical inputs yield identical output.
pub fn map_comments(raw_comments: &[RawComment], hunks: &[DiffHunk]) -> Vec<ReviewComment> {
    let mut mapped: Vec<ReviewComment> = raw_comments
        .iter()
        .filter_map(|raw| {
            let (position, line) = position_for_new_line(hunks, &raw.file_path, raw.line)?;
            Some(ReviewComment {
                file_path: raw.file_path.clone(),
                position,
                old_line_no: line.old_line_no,
                new_line_no: line.new_line_no,
                severity: raw.severity,
                message: raw.message.clone(),
            })
        })
        .collect();

    mapped.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then(a.position.cmp(&b.position))
    });
    mapped
}
