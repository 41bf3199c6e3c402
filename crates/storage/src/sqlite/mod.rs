use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use thiserror::Error;

use crate::repository::Storage;

mod answer_repo;
mod generation_log_repo;
mod mapping;
mod migrate;
mod price_book_repo;
mod session_repo;

/// Session rows, answers, generation logs and prices in one `SQLite` file.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl SqliteRepository {
    /// Open (creating if needed) the database at `database_url`.
    ///
    /// Every connection runs with foreign keys on, WAL journaling and a
    /// five second busy timeout, so concurrent conditional writes wait for
    /// each other instead of failing with `SQLITE_BUSY`.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the URL is invalid or the connection
    /// cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if migration queries fail.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }
}

impl Storage {
    /// Open and migrate a `SQLite` database, sharing one pool across all
    /// repositories.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations cannot be
    /// completed.
    pub async fn sqlite(database_url: &str) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::connect(database_url).await?;
        repo.migrate().await?;
        Ok(Self {
            sessions: Arc::new(repo.clone()),
            answers: Arc::new(repo.clone()),
            generation_logs: Arc::new(repo.clone()),
            price_book: Arc::new(repo),
        })
    }
}
