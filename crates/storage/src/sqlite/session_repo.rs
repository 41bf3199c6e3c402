use async_trait::async_trait;
use chrono::Utc;
use qudrat_core::model::{NewSession, Session, SessionId, UserId};

use super::SqliteRepository;
use super::mapping::{
    SessionDocuments, conn, kind_columns, map_session_row, session_id_to_i64, u64_to_i64,
    user_id_to_text,
};
use crate::repository::{SessionRepository, StorageError};

const SESSION_COLUMNS: &str = r"
    id, user_id, kind, track, section, status, paused_at, ended_at, failure_reason,
    started_at, active_since, time_paused_secs, time_spent_secs, remaining_time_secs,
    total_questions, batch_size, categories, questions, generated_batches,
    generation_context, pending_batch_index, pending_batch_claimed_at, scores, revision
";

#[async_trait]
impl SessionRepository for SqliteRepository {
    async fn insert_session(&self, session: &NewSession) -> Result<Session, StorageError> {
        let (kind, track, section) = kind_columns(session.kind);
        let docs = SessionDocuments::encode(
            &session.categories,
            &[],
            &qudrat_core::model::GenerationContext::empty(),
            None,
        )?;

        let result = sqlx::query(
            r"
            INSERT INTO sessions (
                user_id, kind, track, section, status, started_at, active_since,
                time_paused_secs, time_spent_secs, remaining_time_secs, total_questions,
                batch_size, categories, questions, generated_batches, generation_context,
                revision, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 'in_progress', ?5, ?5, 0, 0, ?6, ?7, ?8, ?9, ?10, 0, ?11, 0, ?12)
            ",
        )
        .bind(user_id_to_text(session.user_id))
        .bind(kind)
        .bind(track)
        .bind(section)
        .bind(session.started_at)
        .bind(
            session
                .remaining_time_secs
                .map(|v| u64_to_i64("remaining_time_secs", v))
                .transpose()?,
        )
        .bind(i64::from(session.total_questions))
        .bind(i64::from(session.batch_size))
        .bind(docs.categories)
        .bind(docs.questions)
        .bind(docs.generation_context)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        let id = u64::try_from(result.last_insert_rowid())
            .map_err(|_| StorageError::Serialization("session_id sign overflow".into()))?;
        Ok(session.clone().into_session(SessionId::new(id)))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))
            .bind(session_id_to_i64(id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        row.as_ref().map(map_session_row).transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<u64, StorageError> {
        let (kind, track, section) = kind_columns(session.kind());
        let docs = SessionDocuments::of(session)?;
        let id = session_id_to_i64(session.id())?;
        let expected = u64_to_i64("revision", session.revision())?;

        // only the revision the caller read may be replaced
        let result = sqlx::query(
            r"
            UPDATE sessions
            SET kind = ?1,
                track = ?2,
                section = ?3,
                status = ?4,
                paused_at = ?5,
                ended_at = ?6,
                failure_reason = ?7,
                active_since = ?8,
                time_paused_secs = ?9,
                time_spent_secs = ?10,
                remaining_time_secs = ?11,
                categories = ?12,
                questions = ?13,
                generated_batches = ?14,
                generation_context = ?15,
                scores = ?16,
                pending_batch_index = ?17,
                pending_batch_claimed_at = ?18,
                revision = revision + 1,
                updated_at = ?19
            WHERE id = ?20 AND revision = ?21
            ",
        )
        .bind(kind)
        .bind(track)
        .bind(section)
        .bind(session.status().as_str())
        .bind(session.paused_at())
        .bind(session.ended_at())
        .bind(session.lifecycle().failure_reason())
        .bind(session.active_since())
        .bind(u64_to_i64("time_paused_secs", session.time_paused_secs())?)
        .bind(u64_to_i64("time_spent_secs", session.time_spent_secs())?)
        .bind(
            session
                .remaining_time_secs()
                .map(|v| u64_to_i64("remaining_time_secs", v))
                .transpose()?,
        )
        .bind(docs.categories)
        .bind(docs.questions)
        .bind(i64::from(session.generated_batches()))
        .bind(docs.generation_context)
        .bind(docs.scores)
        .bind(session.pending_batch().map(|claim| i64::from(claim.batch_index)))
        .bind(session.pending_batch().map(|claim| claim.claimed_at))
        .bind(Utc::now())
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(conn)?;
            return Err(if exists.is_some() {
                StorageError::Conflict
            } else {
                StorageError::NotFound
            });
        }

        Ok(session.revision() + 1)
    }

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<Session>, StorageError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE user_id = ?1
            ORDER BY started_at DESC, id DESC
            LIMIT ?2
            "
        ))
        .bind(user_id_to_text(user_id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_session_row).collect()
    }
}
