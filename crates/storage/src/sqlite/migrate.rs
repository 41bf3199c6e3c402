use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs the versioned migrations for the current schema.
///
/// Version 1 creates sessions, answers, generation logs, the price book, and
/// their indexes.
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        // questions, categories, generation context and scores are JSON documents;
        // paused_at is set exactly when the session is paused
        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('exam', 'practice')),
                    track TEXT,
                    section TEXT,
                    status TEXT NOT NULL
                        CHECK (status IN ('in_progress', 'paused', 'completed', 'abandoned', 'failed')),
                    paused_at TEXT,
                    ended_at TEXT,
                    failure_reason TEXT,
                    started_at TEXT NOT NULL,
                    active_since TEXT NOT NULL,
                    time_paused_secs INTEGER NOT NULL CHECK (time_paused_secs >= 0),
                    time_spent_secs INTEGER NOT NULL CHECK (time_spent_secs >= 0),
                    remaining_time_secs INTEGER CHECK (remaining_time_secs >= 0),
                    total_questions INTEGER NOT NULL CHECK (total_questions > 0),
                    batch_size INTEGER NOT NULL CHECK (batch_size > 0),
                    categories TEXT NOT NULL,
                    questions TEXT NOT NULL,
                    generated_batches INTEGER NOT NULL CHECK (generated_batches >= 0),
                    generation_context TEXT NOT NULL,
                    scores TEXT,
                    revision INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL,
                    CHECK ((status = 'paused') = (paused_at IS NOT NULL))
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS answers (
                    session_id INTEGER NOT NULL,
                    question_index INTEGER NOT NULL CHECK (question_index >= 0),
                    selected_answer INTEGER NOT NULL CHECK (selected_answer BETWEEN 0 AND 3),
                    is_correct INTEGER NOT NULL,
                    time_spent_secs INTEGER NOT NULL CHECK (time_spent_secs >= 0),
                    answered_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, question_index),
                    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS generation_logs (
                    id INTEGER PRIMARY KEY,
                    session_id INTEGER NOT NULL,
                    user_id TEXT NOT NULL,
                    batch_index INTEGER NOT NULL CHECK (batch_index >= 0),
                    requested INTEGER NOT NULL CHECK (requested >= 0),
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('started', 'succeeded', 'failed')),
                    duration_ms INTEGER,
                    question_count INTEGER NOT NULL DEFAULT 0,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    cached_tokens INTEGER,
                    cache_hit INTEGER NOT NULL DEFAULT 0,
                    cost_micro_usd INTEGER,
                    error TEXT
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS price_book (
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    input_micro_usd_per_million INTEGER NOT NULL CHECK (input_micro_usd_per_million >= 0),
                    cached_input_micro_usd_per_million INTEGER NOT NULL
                        CHECK (cached_input_micro_usd_per_million >= 0),
                    output_micro_usd_per_million INTEGER NOT NULL CHECK (output_micro_usd_per_million >= 0),
                    deprecated INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (provider, model)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_sessions_user_started
                    ON sessions (user_id, started_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_generation_logs_user_started
                    ON generation_logs (user_id, started_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_generation_logs_session_batch
                    ON generation_logs (session_id, batch_index);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    if !is_applied(pool, 2).await? {
        let mut tx = pool.begin().await?;

        // a refill's hold on the next batch; both set or both null
        sqlx::query("ALTER TABLE sessions ADD COLUMN pending_batch_index INTEGER")
            .execute(&mut *tx)
            .await?;
        sqlx::query("ALTER TABLE sessions ADD COLUMN pending_batch_claimed_at TEXT")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(2_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
