//! Async wrapper over the SQLite review store.
//!
//! `rusqlite` calls are blocking, so every operation hops onto the
//! blocking thread pool. The handle is cheap to clone and shared by
//! the workers and the HTTP handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::task;
use uuid::Uuid;

use reviewd_core::Review;

use crate::db::{ReviewFilter, SqliteDb};
use crate::error::StorageError;

#[derive(Clone)]
pub struct ReviewStore {
    db: Arc<SqliteDb>,
}

impl ReviewStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Arc::new(SqliteDb::new(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(SqliteDb::new_in_memory()?),
        })
    }

    pub async fn append(&self, review: Review) -> Result<(), StorageError> {
        let db = self.db.clone();
        task::spawn_blocking(move || db.insert_review(&review)).await?
    }

    pub async fn list(&self, filter: ReviewFilter) -> Result<Vec<Review>, StorageError> {
        let db = self.db.clone();
        task::spawn_blocking(move || db.list_reviews(&filter)).await?
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Review>, StorageError> {
        let db = self.db.clone();
        task::spawn_blocking(move || db.get_review(id)).await?
    }

    /// The canonical (most recent) review for a commit.
    pub async fn latest(
        &self,
        repo: String,
        commit_sha: String,
    ) -> Result<Option<Review>, StorageError> {
        let db = self.db.clone();
        task::spawn_blocking(move || db.latest_review(&repo, &commit_sha)).await?
    }
}
