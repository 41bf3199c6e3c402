use async_trait::async_trait;
use qudrat_core::model::{Answer, SessionId};

use super::SqliteRepository;
use super::mapping::{conn, map_answer_row, session_id_to_i64};
use crate::repository::{AnswerRepository, StorageError};

#[async_trait]
impl AnswerRepository for SqliteRepository {
    async fn insert_answer(&self, answer: &Answer) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            INSERT INTO answers (
                session_id, question_index, selected_answer, is_correct, time_spent_secs, answered_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6
            WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1 AND status = 'in_progress')
            ",
        )
        .bind(session_id_to_i64(answer.session_id())?)
        .bind(i64::from(answer.question_index()))
        .bind(i64::from(answer.selected_answer()))
        .bind(i64::from(answer.is_correct()))
        .bind(i64::from(answer.time_spent_secs()))
        .bind(answer.answered_at())
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict,
            other => conn(other),
        })?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionClosed);
        }
        Ok(())
    }

    async fn list_answers(&self, session_id: SessionId) -> Result<Vec<Answer>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT session_id, question_index, selected_answer, is_correct, time_spent_secs, answered_at
            FROM answers
            WHERE session_id = ?1
            ORDER BY question_index
            ",
        )
        .bind(session_id_to_i64(session_id)?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_answer_row).collect()
    }
}
