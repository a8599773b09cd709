//! SQLite persistence for completed reviews.
//!
//! The store is append-only: reviews are inserted once and never
//! updated or deleted, so re-running a job can only add a newer record.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and
//! add a migration function in `run_migrations`.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Mutex;
use uuid::Uuid;

use reviewd_core::{Review, ReviewComment, Severity};

use crate::error::StorageError;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Filters for listing stored reviews.
#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    pub repo: Option<String>,
    pub commit_sha: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// SQLite database for persisting completed reviews.
///
/// Uses a `Mutex<Connection>` because `rusqlite::Connection` is not
/// `Sync`. Callers should wrap operations in
/// `tokio::task::spawn_blocking` for async compatibility.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                summary TEXT NOT NULL,
                model_used TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS review_comments (
                review_id TEXT NOT NULL REFERENCES reviews(id),
                file_path TEXT NOT NULL,
                position INTEGER NOT NULL,
                old_line_no INTEGER,
                new_line_no INTEGER,
                severity TEXT NOT NULL CHECK(severity IN ('info', 'warning', 'critical')),
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reviews_repo_commit
            ON reviews(repo, commit_sha);

            CREATE INDEX IF NOT EXISTS idx_comments_review
            ON review_comments(review_id);
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    /// Append a completed review and its comments in one transaction.
    pub fn insert_review(&self, review: &Review) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO reviews (id, repo, commit_sha, summary, model_used, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                review.id.to_string(),
                &review.repo,
                &review.commit_sha,
                &review.summary,
                &review.model_used,
                review.created_at.to_rfc3339(),
            ],
        )?;

        for comment in &review.comments {
            tx.execute(
                r#"
                INSERT INTO review_comments
                    (review_id, file_path, position, old_line_no, new_line_no, severity, message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                rusqlite::params![
                    review.id.to_string(),
                    &comment.file_path,
                    comment.position,
                    comment.old_line_no,
                    comment.new_line_no,
                    comment.severity.as_str(),
                    &comment.message,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// List stored reviews, newest first, honoring the filter.
    pub fn list_reviews(&self, filter: &ReviewFilter) -> Result<Vec<Review>, StorageError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let limit = filter.limit.unwrap_or(50);
        let offset = filter.offset.unwrap_or(0);
        let mut stmt = conn.prepare(
            r#"
            SELECT id, repo, commit_sha, summary, model_used, created_at
            FROM reviews
            WHERE (?1 IS NULL OR repo = ?1)
              AND (?2 IS NULL OR commit_sha = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
        )?;

        let rows = stmt.query_map(
            rusqlite::params![filter.repo, filter.commit_sha, limit, offset],
            review_from_row,
        )?;

        let mut reviews = Vec::new();
        for row in rows {
            let mut review = row?;
            review.comments = Self::comments_for(&conn, review.id)?;
            reviews.push(review);
        }

        Ok(reviews)
    }

    /// Fetch one review by id.
    pub fn get_review(&self, id: Uuid) -> Result<Option<Review>, StorageError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn.prepare(
            r#"
            SELECT id, repo, commit_sha, summary, model_used, created_at
            FROM reviews
            WHERE id = ?1
            "#,
        )?;

        let result = stmt.query_row(rusqlite::params![id.to_string()], review_from_row);
        match result {
            Ok(mut review) => {
                review.comments = Self::comments_for(&conn, review.id)?;
                Ok(Some(review))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The canonical review for a commit: the most recently created
    /// record, since the store is append-only and never overwrites.
    pub fn latest_review(
        &self,
        repo: &str,
        commit_sha: &str,
    ) -> Result<Option<Review>, StorageError> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn.prepare(
            r#"
            SELECT id, repo, commit_sha, summary, model_used, created_at
            FROM reviews
            WHERE repo = ?1 AND commit_sha = ?2
            ORDER BY created_at DESC, id
            LIMIT 1
            "#,
        )?;

        let result = stmt.query_row(rusqlite::params![repo, commit_sha], review_from_row);
        match result {
            Ok(mut review) => {
                review.comments = Self::comments_for(&conn, review.id)?;
                Ok(Some(review))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn comments_for(conn: &Connection, review_id: Uuid) -> Result<Vec<ReviewComment>, StorageError> {
        let mut stmt = conn.prepare(
            r#"
            SELECT file_path, position, old_line_no, new_line_no, severity, message
            FROM review_comments
            WHERE review_id = ?1
            ORDER BY rowid
            "#,
        )?;

        let rows = stmt.query_map(rusqlite::params![review_id.to_string()], |row| {
            let severity: String = row.get(4)?;
            Ok(ReviewComment {
                file_path: row.get(0)?,
                position: row.get(1)?,
                old_line_no: row.get(2)?,
                new_line_no: row.get(3)?,
                severity: Severity::from_str_lossy(&severity),
                message: row.get(5)?,
            })
        })?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }
}

fn review_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(5)?;

    let id = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(Review {
        id,
        repo: row.get(1)?,
        commit_sha: row.get(2)?,
        summary: row.get(3)?,
        comments: Vec::new(),
        created_at,
        model_used: row.get(4)?,
    })
}
