use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qudrat_core::model::{SessionId, UserId};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{
    conn, map_generation_log_row, ser, session_id_to_i64, status_to_str, u64_to_i64,
    user_id_to_text,
};
use crate::repository::{
    GenerationCompletion, GenerationLogRecord, GenerationLogRepository, GenerationStatus,
    NewGenerationLog, StorageError,
};

#[async_trait]
impl GenerationLogRepository for SqliteRepository {
    async fn insert_started(&self, record: NewGenerationLog) -> Result<i64, StorageError> {
        let result = sqlx::query(
            r"
            INSERT INTO generation_logs (
                session_id, user_id, batch_index, requested, provider, model, started_at, status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(session_id_to_i64(record.session_id)?)
        .bind(user_id_to_text(record.user_id))
        .bind(i64::from(record.batch_index))
        .bind(i64::from(record.requested))
        .bind(record.provider)
        .bind(record.model)
        .bind(record.started_at)
        .bind(status_to_str(GenerationStatus::Started))
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(result.last_insert_rowid())
    }

    async fn update_completion(
        &self,
        id: i64,
        completion: GenerationCompletion,
    ) -> Result<(), StorageError> {
        let status = if completion.succeeded {
            GenerationStatus::Succeeded
        } else {
            GenerationStatus::Failed
        };
        let result = sqlx::query(
            r"
            UPDATE generation_logs
            SET status = ?1,
                duration_ms = ?2,
                question_count = ?3,
                prompt_tokens = ?4,
                completion_tokens = ?5,
                cached_tokens = ?6,
                cache_hit = ?7,
                cost_micro_usd = ?8,
                error = ?9
            WHERE id = ?10
            ",
        )
        .bind(status_to_str(status))
        .bind(u64_to_i64("duration_ms", completion.duration_ms)?)
        .bind(i64::from(completion.question_count))
        .bind(completion.prompt_tokens.map(i64::from))
        .bind(completion.completion_tokens.map(i64::from))
        .bind(completion.cached_tokens.map(i64::from))
        .bind(i64::from(completion.cache_hit))
        .bind(
            completion
                .cost_micro_usd
                .map(|val| i64::try_from(val).unwrap_or(i64::MAX)),
        )
        .bind(completion.error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        Ok(())
    }

    async fn count_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) as count
            FROM generation_logs
            WHERE user_id = ?1 AND started_at >= ?2
            ",
        )
        .bind(user_id_to_text(user_id))
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(conn)?;

        let count: i64 = row.try_get("count").map_err(ser)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn last_started_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT started_at
            FROM generation_logs
            WHERE user_id = ?1
            ORDER BY started_at DESC
            LIMIT 1
            ",
        )
        .bind(user_id_to_text(user_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        row.map(|row| row.try_get("started_at").map_err(ser))
            .transpose()
    }

    async fn sum_cost_since(&self, since: DateTime<Utc>) -> Result<u64, StorageError> {
        let row = sqlx::query(
            r"
            SELECT COALESCE(SUM(cost_micro_usd), 0) as total_cost
            FROM generation_logs
            WHERE started_at >= ?1
            ",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(conn)?;

        let total: i64 = row.try_get("total_cost").map_err(ser)?;
        Ok(u64::try_from(total).unwrap_or(u64::MAX))
    }

    async fn list_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<GenerationLogRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, session_id, user_id, batch_index, requested, provider, model, started_at,
                status, duration_ms, question_count, prompt_tokens, completion_tokens,
                cached_tokens, cache_hit, cost_micro_usd, error
            FROM generation_logs
            WHERE session_id = ?1
            ORDER BY batch_index, id
            ",
        )
        .bind(session_id_to_i64(session_id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_generation_log_row).collect()
    }
}
