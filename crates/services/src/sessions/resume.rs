use qudrat_core::model::{Session, SessionId, SessionStateError, SessionStatus, UserId};
use storage::repository::StorageError;

use super::lifecycle::{MAX_WRITE_ATTEMPTS, SessionService, write_error};
use super::view::{ResumeResult, SessionSummary, answer_views, views_with_answers};
use crate::error::SessionError;

impl SessionService {
    /// Resume a paused session and return everything the client needs to
    /// continue.
    ///
    /// Idempotent: resuming a session that is already running reports
    /// `already_resumed` without writing. A write that loses a race re-reads
    /// the session and evaluates it again, so concurrent resumes add the
    /// pause duration once.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound`, `SessionError::Forbidden`, or
    /// `SessionError::InvalidState` when the session is neither paused nor
    /// running.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub async fn resume(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<ResumeResult, SessionError> {
        let now = self.clock.now();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut session = self.load_owned(session_id, user_id).await?;
            match session.status() {
                SessionStatus::InProgress => {
                    tracing::debug!("session already running");
                    return self.resume_result(session, true).await;
                }
                SessionStatus::Paused => {}
                status => {
                    return Err(SessionError::InvalidState(SessionStateError::NotPaused {
                        status,
                    }));
                }
            }

            let pause_secs = session.resume(now)?;
            match self.sessions.update_session(&session).await {
                Ok(revision) => {
                    session.mark_persisted(revision);
                    tracing::info!(
                        pause_secs,
                        time_paused_secs = session.time_paused_secs(),
                        "session resumed"
                    );
                    return self.resume_result(session, false).await;
                }
                Err(StorageError::Conflict) => {
                    tracing::debug!(attempt, "concurrent resume; re-reading");
                }
                Err(e) => return Err(write_error(e)),
            }
        }
        Err(SessionError::Conflict)
    }

    async fn resume_result(
        &self,
        session: Session,
        already_resumed: bool,
    ) -> Result<ResumeResult, SessionError> {
        let answers = self.answers.list_answers(session.id()).await?;
        Ok(ResumeResult {
            session: SessionSummary::at(&session, self.clock.now()),
            questions: views_with_answers(session.questions(), &answers),
            answers: answer_views(&session, &answers),
            needs_more_questions: session.needs_more_questions(),
            already_resumed,
        })
    }
}
