use std::sync::Arc;

use chrono::{DateTime, Utc};

use qudrat_core::model::{
    Answer, BatchClaim, BatchClaimOutcome, Difficulty, NewSession, Session, SessionId,
    SessionKind, SessionStateError, TimeSnapshot, UserId, compute_scores,
};
use storage::repository::{AnswerRepository, SessionRepository, StorageError};

use super::view::{
    AnswerView, CreatedSession, GenerationStats, RefillResult, SessionDetail, SessionSummary,
    stripped_views, views_with_answers,
};
use crate::Clock;
use crate::config::ServiceConfig;
use crate::error::SessionError;
use crate::generation::{BatchGenerator, BatchParams};

/// Conditional writes are retried this many times before giving up.
pub(crate) const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Default page size of [`SessionService::list_sessions`].
pub const DEFAULT_LIST_LIMIT: u32 = 20;

/// A batch claim outlives the provider timeout by this much before another
/// refill may take it over.
const CLAIM_GRACE_SECS: u64 = 30;

//
// ─── REQUESTS ──────────────────────────────────────────────────────────────────
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSession {
    pub user_id: UserId,
    pub kind: SessionKind,
    pub total_questions: u32,
    /// Empty means the default categories of the session's sections.
    pub categories: Vec<String>,
    /// Pins every question of the first batch to one level; `None` uses the mix.
    pub difficulty: Option<Difficulty>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitAnswer {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub question_index: u32,
    pub selected_answer: u8,
    pub time_spent_secs: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishAction {
    Complete,
    Abandon,
}

//
// ─── SERVICE ───────────────────────────────────────────────────────────────────
//

/// Request handlers for exam and practice sessions.
///
/// Stateless between calls: every operation loads the session, validates
/// the transition, and writes back conditionally on the loaded revision.
#[derive(Clone)]
pub struct SessionService {
    pub(super) clock: Clock,
    pub(super) sessions: Arc<dyn SessionRepository>,
    pub(super) answers: Arc<dyn AnswerRepository>,
    generator: BatchGenerator,
    config: ServiceConfig,
}

impl SessionService {
    #[must_use]
    pub fn new(
        clock: Clock,
        sessions: Arc<dyn SessionRepository>,
        answers: Arc<dyn AnswerRepository>,
        generator: BatchGenerator,
        config: ServiceConfig,
    ) -> Self {
        Self {
            clock,
            sessions,
            answers,
            generator,
            config,
        }
    }

    /// Create a session and generate its first batch.
    ///
    /// If the first batch cannot be generated or stored the session is kept
    /// as `failed` and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` for a bad request,
    /// `SessionError::Generation`/`Budget` when the first batch fails, and
    /// `SessionError::Storage` on persistence failures.
    #[tracing::instrument(skip_all, fields(user_id = %request.user_id))]
    pub async fn create_session(&self, request: CreateSession) -> Result<CreatedSession, SessionError> {
        let now = self.clock.now();
        let new_session = NewSession::new(
            request.user_id,
            request.kind,
            request.total_questions,
            self.config.batch_size,
            request.categories,
            now,
            self.config.exam_duration_secs(request.total_questions),
        )?;
        let mut session = self.sessions.insert_session(&new_session).await?;
        tracing::info!(
            session_id = %session.id(),
            kind = ?session.kind(),
            total_questions = session.total_questions(),
            "session created"
        );

        let params = BatchParams::for_session(&session, request.difficulty);
        let output = match self
            .generator
            .generate_batch(&params, session.generation_context())
            .await
        {
            Ok(output) => output,
            Err(err) => {
                self.mark_failed(session, &err).await;
                return Err(err.into());
            }
        };

        let fresh = session.clone();
        let stored = match session.append_batch(params.batch_index, output.questions, output.context)
        {
            Ok(_) => self
                .sessions
                .update_session(&session)
                .await
                .map_err(write_error),
            Err(e) => Err(SessionError::from(e)),
        };
        match stored {
            Ok(revision) => session.mark_persisted(revision),
            Err(err) => {
                self.mark_failed(fresh, &err).await;
                return Err(err);
            }
        }

        Ok(CreatedSession {
            session: SessionSummary::at(&session, now),
            questions: stripped_views(session.questions(), 0),
        })
    }

    /// `in_progress → paused`, keeping the client's timer snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is in progress.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub async fn pause(
        &self,
        session_id: SessionId,
        user_id: UserId,
        snapshot: TimeSnapshot,
    ) -> Result<SessionSummary, SessionError> {
        let now = self.clock.now();
        let session = self
            .mutate(session_id, user_id, |session| {
                session.pause(now, snapshot).map_err(SessionError::from)
            })
            .await?;
        tracing::info!(remaining_secs = ?session.remaining_time_secs(), "session paused");
        Ok(SessionSummary::at(&session, now))
    }

    /// Complete (with scores) or abandon an in-progress session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is in progress.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, user_id = %user_id, action = ?action))]
    pub async fn finish(
        &self,
        session_id: SessionId,
        user_id: UserId,
        action: FinishAction,
        time_spent_secs: Option<u64>,
    ) -> Result<SessionSummary, SessionError> {
        let now = self.clock.now();
        let session = match action {
            FinishAction::Complete => {
                let answers = self.answers.list_answers(session_id).await?;
                let session = self
                    .mutate(session_id, user_id, |session| {
                        let scores = compute_scores(session.questions(), &answers);
                        session
                            .complete(now, scores, time_spent_secs)
                            .map_err(SessionError::from)
                    })
                    .await?;
                self.settle_scores(session, &answers).await?
            }
            FinishAction::Abandon => {
                self.mutate(session_id, user_id, |session| {
                    session
                        .abandon(now, time_spent_secs)
                        .map_err(SessionError::from)
                })
                .await?
            }
        };
        tracing::info!(
            status = %session.status(),
            overall_score = ?session.scores().map(|scores| scores.overall_score),
            "session finished"
        );
        Ok(SessionSummary::at(&session, now))
    }

    /// Grade and record one answer. Each question accepts a single answer.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` unless the session is in progress,
    /// `SessionError::AlreadyAnswered` for a second answer to the same
    /// question, and `SessionError::Validation` for an unknown question or choice.
    #[tracing::instrument(
        skip_all,
        fields(session_id = %request.session_id, question_index = request.question_index)
    )]
    pub async fn submit_answer(&self, request: SubmitAnswer) -> Result<AnswerView, SessionError> {
        let session = self.load_owned(request.session_id, request.user_id).await?;
        let answer = session.grade_answer(
            request.question_index,
            request.selected_answer,
            request.time_spent_secs,
            self.clock.now(),
        )?;
        let question = session
            .question(request.question_index)
            .ok_or_else(|| SessionError::Validation("unknown question".into()))?;

        match self.answers.insert_answer(&answer).await {
            Ok(()) => {}
            Err(StorageError::Conflict) => {
                return Err(SessionError::AlreadyAnswered {
                    question_index: request.question_index,
                });
            }
            Err(StorageError::SessionClosed) => {
                // paused or finished since it was loaded
                let status = self
                    .load_owned(request.session_id, request.user_id)
                    .await?
                    .status();
                return Err(SessionError::InvalidState(SessionStateError::NotInProgress {
                    status,
                }));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(is_correct = answer.is_correct(), "answer recorded");
        Ok(AnswerView::new(&answer, question))
    }

    /// Generate and append the next batch.
    ///
    /// The batch is claimed on the session row before the provider is called,
    /// so concurrent refills of one session never generate in parallel: a
    /// caller that finds the batch claimed returns at once with no questions
    /// and `generating_batch` set. A failed batch releases its claim, leaves
    /// the session otherwise untouched, and may be retried.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` for ended sessions,
    /// `SessionError::Generation`/`Budget` when the batch fails, and
    /// `SessionError::Conflict` when an expired claim was taken over and the
    /// other refill appended the batch first.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, user_id = %user_id))]
    pub async fn refill(
        &self,
        session_id: SessionId,
        user_id: UserId,
        difficulty: Option<Difficulty>,
    ) -> Result<RefillResult, SessionError> {
        let now = self.clock.now();
        let (session, claim) = match self.claim_batch(session_id, user_id, now).await? {
            (session, BatchClaimOutcome::Claimed(claim)) => (session, claim),
            (session, outcome) => {
                if let BatchClaimOutcome::InFlight(claim) = outcome {
                    tracing::info!(batch_index = claim.batch_index, "batch already being generated");
                }
                return Ok(RefillResult {
                    session: SessionSummary::at(&session, now),
                    questions: Vec::new(),
                    batch_index: None,
                });
            }
        };

        let params = BatchParams::for_session(&session, difficulty);
        let output = match self
            .generator
            .generate_batch(&params, session.generation_context())
            .await
        {
            Ok(output) => output,
            Err(err) => {
                self.release_claim(session_id, user_id, claim).await;
                return Err(err.into());
            }
        };

        let mut offset = 0;
        let appended = self
            .mutate(session_id, user_id, |session| {
                offset = session.questions().len();
                match session.append_batch(
                    params.batch_index,
                    output.questions.clone(),
                    output.context.clone(),
                ) {
                    Ok(_) => Ok(()),
                    Err(SessionStateError::BatchOrder(_)) => Err(SessionError::Conflict),
                    Err(e) => Err(e.into()),
                }
            })
            .await;
        let session = match appended {
            Ok(session) => session,
            Err(err) => {
                self.release_claim(session_id, user_id, claim).await;
                return Err(err);
            }
        };

        Ok(RefillResult {
            questions: stripped_views(&session.questions()[offset..], offset),
            session: SessionSummary::at(&session, now),
            batch_index: Some(params.batch_index),
        })
    }

    /// Owner-scoped session with every question; answered ones carry their key.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` or `SessionError::Forbidden`.
    pub async fn get_session(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<SessionDetail, SessionError> {
        let session = self.load_owned(session_id, user_id).await?;
        let answers = self.answers.list_answers(session_id).await?;
        Ok(SessionDetail {
            session: SessionSummary::at(&session, self.clock.now()),
            questions: views_with_answers(session.questions(), &answers),
            answered_count: u32::try_from(answers.len()).unwrap_or(u32::MAX),
        })
    }

    /// A user's sessions, most recently started first.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on persistence failures.
    pub async fn list_sessions(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<SessionSummary>, SessionError> {
        let now = self.clock.now();
        let sessions = self.sessions.list_sessions_for_user(user_id, limit).await?;
        Ok(sessions
            .iter()
            .map(|session| SessionSummary::at(session, now))
            .collect())
    }

    /// Prompt-cache effectiveness and spend for one session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound`, `SessionError::Forbidden`, or
    /// `SessionError::Storage`.
    pub async fn generation_stats(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<GenerationStats, SessionError> {
        self.load_owned(session_id, user_id).await?;
        let logger = self.generator.logger();
        let cache = logger.cache_stats(session_id).await?;
        Ok(GenerationStats {
            session_id,
            cache_hit_rate_percent: cache.hit_rate_percent(),
            cache,
            cost_today_micro_usd: logger.cost_today().await?,
        })
    }

    //
    // ─── HELPERS ───────────────────────────────────────────────────────────────
    //

    pub(super) async fn load_owned(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Session, SessionError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if session.user_id() != user_id {
            return Err(SessionError::Forbidden);
        }
        Ok(session)
    }

    /// Load, apply `change`, and write back on the loaded revision. A lost
    /// race re-reads and re-validates against the winner's state.
    async fn mutate(
        &self,
        session_id: SessionId,
        user_id: UserId,
        mut change: impl FnMut(&mut Session) -> Result<(), SessionError>,
    ) -> Result<Session, SessionError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut session = self.load_owned(session_id, user_id).await?;
            change(&mut session)?;
            match self.sessions.update_session(&session).await {
                Ok(revision) => {
                    session.mark_persisted(revision);
                    return Ok(session);
                }
                Err(StorageError::Conflict) => {
                    tracing::debug!(attempt, "session write lost a race; re-reading");
                }
                Err(e) => return Err(write_error(e)),
            }
        }
        Err(SessionError::Conflict)
    }

    /// Reserve the next batch with a conditional write.
    async fn claim_batch(
        &self,
        session_id: SessionId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Session, BatchClaimOutcome), SessionError> {
        let lease_secs = self
            .config
            .generation_timeout
            .as_secs()
            .saturating_add(CLAIM_GRACE_SECS);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut session = self.load_owned(session_id, user_id).await?;
            let outcome = session.claim_next_batch(now, lease_secs)?;
            if !matches!(outcome, BatchClaimOutcome::Claimed(_)) {
                return Ok((session, outcome));
            }
            match self.sessions.update_session(&session).await {
                Ok(revision) => {
                    session.mark_persisted(revision);
                    return Ok((session, outcome));
                }
                Err(StorageError::Conflict) => {
                    tracing::debug!(attempt, "batch claim lost a race; re-reading");
                }
                Err(e) => return Err(write_error(e)),
            }
        }
        Err(SessionError::Conflict)
    }

    async fn release_claim(&self, session_id: SessionId, user_id: UserId, claim: BatchClaim) {
        let released = self
            .mutate(session_id, user_id, |session| {
                if session.release_batch(claim) {
                    Ok(())
                } else {
                    // taken over or already cleared; nothing to write
                    Err(SessionError::Conflict)
                }
            })
            .await;
        match released {
            Ok(_) | Err(SessionError::Conflict) => {}
            Err(e) => {
                tracing::warn!(
                    batch_index = claim.batch_index,
                    error = &e as &dyn std::error::Error,
                    "failed to release batch claim"
                );
            }
        }
    }

    /// Rescore a just-completed session if answers were stored between the
    /// listing and the completing write. Completed sessions accept no more
    /// answers, so this second listing is final.
    async fn settle_scores(
        &self,
        session: Session,
        scored: &[Answer],
    ) -> Result<Session, SessionError> {
        let answers = self.answers.list_answers(session.id()).await?;
        if answers.as_slice() == scored {
            return Ok(session);
        }
        tracing::info!(
            scored = scored.len(),
            stored = answers.len(),
            "answers arrived during completion; rescoring"
        );
        self.mutate(session.id(), session.user_id(), |session| {
            let scores = compute_scores(session.questions(), &answers);
            session.rescore(scores).map_err(SessionError::from)
        })
        .await
    }

    async fn mark_failed(&self, mut session: Session, err: &(dyn std::error::Error + 'static)) {
        tracing::warn!(
            session_id = %session.id(),
            error = err,
            "first batch could not be generated or stored; marking session failed"
        );
        if let Err(e) = session.fail(self.clock.now(), err.to_string()) {
            tracing::warn!(error = &e as &dyn std::error::Error, "cannot mark session failed");
            return;
        }
        if let Err(e) = self.sessions.update_session(&session).await {
            tracing::warn!(error = &e as &dyn std::error::Error, "failed to persist failed session");
        }
    }
}

pub(super) fn write_error(err: StorageError) -> SessionError {
    match err {
        StorageError::Conflict => SessionError::Conflict,
        StorageError::NotFound => SessionError::NotFound,
        other => SessionError::Storage(other),
    }
}
