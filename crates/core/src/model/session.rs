use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::answer::{Answer, AnswerError};
use crate::model::generation::{GenerationContext, GenerationContextError};
use crate::model::ids::{SessionId, UserId};
use crate::model::question::{Question, Section};
use crate::model::scoring::SessionScores;
use crate::time::elapsed_secs;

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

/// Illegal lifecycle transitions and content mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionStateError {
    #[error("session is not in progress (status: {status})")]
    NotInProgress { status: SessionStatus },

    #[error("session is not paused (status: {status})")]
    NotPaused { status: SessionStatus },

    #[error("session already ended (status: {status})")]
    Ended { status: SessionStatus },

    #[error("session is not completed (status: {status})")]
    NotCompleted { status: SessionStatus },

    #[error("session already holds all {total} questions")]
    Full { total: u32 },

    #[error(transparent)]
    BatchOrder(#[from] GenerationContextError),

    #[error("batch {batch_index} does not match the context it returned")]
    ContextMismatch { batch_index: u32 },

    #[error(transparent)]
    Answer(#[from] AnswerError),

    #[error("invalid session setup: {0}")]
    InvalidSetup(&'static str),

    #[error("persisted session is inconsistent: {0}")]
    InvalidPersistedState(String),
}

//
// ─── STATUS & KIND ────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Paused,
    Completed,
    Abandoned,
    Failed,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Abandoned | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Academic stream of the student; decides the section mix of an exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Scientific,
    Literary,
}

impl Track {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Track::Scientific => "scientific",
            Track::Literary => "literary",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "scientific" | "علمي" => Some(Self::Scientific),
            "literary" | "أدبي" | "ادبي" => Some(Self::Literary),
            _ => None,
        }
    }

    /// Percentage of exam batches drawn from the quantitative section.
    #[must_use]
    pub fn quantitative_share(self) -> u32 {
        match self {
            Track::Scientific => 60,
            Track::Literary => 40,
        }
    }

    /// Section of the exam batch at `batch_index`.
    ///
    /// Spreads quantitative batches evenly so that every prefix of the exam
    /// stays close to the track's share.
    #[must_use]
    pub fn section_for_batch(self, batch_index: u32) -> Section {
        let share = u64::from(self.quantitative_share());
        let before = u64::from(batch_index) * share / 100;
        let after = (u64::from(batch_index) + 1) * share / 100;
        if after > before {
            Section::Quantitative
        } else {
            Section::Verbal
        }
    }
}

/// Exam and practice sessions share one lifecycle; only the content mix differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionKind {
    /// Timed full exam mixing both sections.
    Exam { track: Track },
    /// Untimed drill on a single section.
    Practice { section: Section },
}

impl SessionKind {
    #[must_use]
    pub fn is_exam(self) -> bool {
        matches!(self, SessionKind::Exam { .. })
    }

    #[must_use]
    pub fn section_for_batch(self, batch_index: u32) -> Section {
        match self {
            SessionKind::Exam { track } => track.section_for_batch(batch_index),
            SessionKind::Practice { section } => section,
        }
    }
}

//
// ─── LIFECYCLE STATE MACHINE ──────────────────────────────────────────────────
//

/// Lifecycle state. Only `Paused` carries a pause timestamp, so
/// `paused_at.is_some() ⇔ status == Paused` holds by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    InProgress,
    Paused { paused_at: DateTime<Utc> },
    Completed { ended_at: DateTime<Utc> },
    Abandoned { ended_at: DateTime<Utc> },
    Failed { ended_at: DateTime<Utc>, reason: String },
}

/// Requested lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Pause,
    Resume,
    Complete,
    Abandon,
    Fail { reason: String },
}

impl Lifecycle {
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self {
            Lifecycle::InProgress => SessionStatus::InProgress,
            Lifecycle::Paused { .. } => SessionStatus::Paused,
            Lifecycle::Completed { .. } => SessionStatus::Completed,
            Lifecycle::Abandoned { .. } => SessionStatus::Abandoned,
            Lifecycle::Failed { .. } => SessionStatus::Failed,
        }
    }

    #[must_use]
    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Paused { paused_at } => Some(*paused_at),
            _ => None,
        }
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifecycle::Completed { ended_at }
            | Lifecycle::Abandoned { ended_at }
            | Lifecycle::Failed { ended_at, .. } => Some(*ended_at),
            Lifecycle::InProgress | Lifecycle::Paused { .. } => None,
        }
    }

    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Lifecycle::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The single transition table of the session state machine.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError` when `transition` is not legal from `self`.
    pub fn apply(
        &self,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Lifecycle, SessionStateError> {
        let status = self.status();
        match (self, transition) {
            (Lifecycle::InProgress, Transition::Pause) => Ok(Lifecycle::Paused { paused_at: now }),
            (Lifecycle::Paused { .. }, Transition::Resume) => Ok(Lifecycle::InProgress),
            (Lifecycle::InProgress, Transition::Complete) => {
                Ok(Lifecycle::Completed { ended_at: now })
            }
            (Lifecycle::InProgress, Transition::Abandon) => {
                Ok(Lifecycle::Abandoned { ended_at: now })
            }
            (Lifecycle::InProgress | Lifecycle::Paused { .. }, Transition::Fail { reason }) => {
                Ok(Lifecycle::Failed {
                    ended_at: now,
                    reason: reason.clone(),
                })
            }
            (_, Transition::Resume) => Err(SessionStateError::NotPaused { status }),
            (_, Transition::Fail { .. }) => Err(SessionStateError::Ended { status }),
            (_, Transition::Pause | Transition::Complete | Transition::Abandon) => {
                Err(SessionStateError::NotInProgress { status })
            }
        }
    }
}

//
// ─── BATCH CLAIMS ─────────────────────────────────────────────────────────────
//

/// A refill's hold on the next batch while its provider call runs.
///
/// Claims are written with the session's conditional update, so at most one
/// caller generates a given batch. A claim older than its lease is treated
/// as abandoned and may be taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchClaim {
    pub batch_index: u32,
    pub claimed_at: DateTime<Utc>,
}

impl BatchClaim {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, lease_secs: u64) -> bool {
        elapsed_secs(self.claimed_at, now) < lease_secs
    }
}

/// Result of [`Session::claim_next_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchClaimOutcome {
    Claimed(BatchClaim),
    /// Another caller holds a live claim on the next batch.
    InFlight(BatchClaim),
    /// Every required batch has been generated.
    NotNeeded,
}

//
// ─── NEW SESSION ──────────────────────────────────────────────────────────────
//

/// Validated creation request, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub user_id: UserId,
    pub kind: SessionKind,
    pub total_questions: u32,
    pub batch_size: u32,
    pub categories: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Countdown budget; `Some` for exams only.
    pub remaining_time_secs: Option<u64>,
}

impl NewSession {
    /// Build a creation request.
    ///
    /// Empty or blank categories are dropped; if none remain, the default
    /// categories of the session's sections are used.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidSetup` if `total_questions` or
    /// `batch_size` is zero.
    pub fn new(
        user_id: UserId,
        kind: SessionKind,
        total_questions: u32,
        batch_size: u32,
        categories: Vec<String>,
        started_at: DateTime<Utc>,
        exam_duration_secs: u64,
    ) -> Result<Self, SessionStateError> {
        if total_questions == 0 {
            return Err(SessionStateError::InvalidSetup("total questions must be > 0"));
        }
        if batch_size == 0 {
            return Err(SessionStateError::InvalidSetup("batch size must be > 0"));
        }

        let mut categories: Vec<String> = categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        categories.dedup();
        if categories.is_empty() {
            categories = match kind {
                SessionKind::Practice { section } => section.default_categories(),
                SessionKind::Exam { .. } => Vec::new(),
            };
        }

        Ok(Self {
            user_id,
            kind,
            total_questions,
            batch_size,
            categories,
            started_at,
            remaining_time_secs: kind.is_exam().then_some(exam_duration_secs),
        })
    }

    /// Materialize the session once storage has assigned an id.
    #[must_use]
    pub fn into_session(self, id: SessionId) -> Session {
        Session {
            id,
            user_id: self.user_id,
            kind: self.kind,
            lifecycle: Lifecycle::InProgress,
            started_at: self.started_at,
            active_since: self.started_at,
            time_paused_secs: 0,
            time_spent_secs: 0,
            remaining_time_secs: self.remaining_time_secs,
            questions: Vec::new(),
            total_questions: self.total_questions,
            batch_size: self.batch_size,
            categories: self.categories,
            generated_batches: 0,
            generation_context: GenerationContext::empty(),
            pending_batch: None,
            scores: None,
            revision: 0,
        }
    }
}

//
// ─── SESSION ──────────────────────────────────────────────────────────────────
//

/// Everything needed to rehydrate a session from storage.
#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub kind: SessionKind,
    pub lifecycle: Lifecycle,
    pub started_at: DateTime<Utc>,
    pub active_since: DateTime<Utc>,
    pub time_paused_secs: u64,
    pub time_spent_secs: u64,
    pub remaining_time_secs: Option<u64>,
    pub questions: Vec<Question>,
    pub total_questions: u32,
    pub batch_size: u32,
    pub categories: Vec<String>,
    pub generated_batches: u32,
    pub generation_context: GenerationContext,
    pub pending_batch: Option<BatchClaim>,
    pub scores: Option<SessionScores>,
    pub revision: u64,
}

/// Caller-provided timing snapshot taken when pausing or finishing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSnapshot {
    pub remaining_time_secs: Option<u64>,
    pub time_spent_secs: Option<u64>,
}

/// An exam or practice attempt.
///
/// `questions` and `generation_context` are append-only; every other field is
/// owned by whichever lifecycle transition last ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    kind: SessionKind,
    lifecycle: Lifecycle,
    started_at: DateTime<Utc>,
    active_since: DateTime<Utc>,
    time_paused_secs: u64,
    time_spent_secs: u64,
    remaining_time_secs: Option<u64>,
    questions: Vec<Question>,
    total_questions: u32,
    batch_size: u32,
    categories: Vec<String>,
    generated_batches: u32,
    generation_context: GenerationContext,
    pending_batch: Option<BatchClaim>,
    scores: Option<SessionScores>,
    revision: u64,
}

impl Session {
    /// Rehydrate a session from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidPersistedState` if the stored row
    /// violates a session invariant.
    pub fn from_persisted(parts: PersistedSession) -> Result<Self, SessionStateError> {
        if parts.total_questions == 0 || parts.batch_size == 0 {
            return Err(SessionStateError::InvalidPersistedState(
                "zero total questions or batch size".into(),
            ));
        }
        if parts.questions.len() > usize_from(parts.total_questions) {
            return Err(SessionStateError::InvalidPersistedState(format!(
                "{} questions exceed total {}",
                parts.questions.len(),
                parts.total_questions
            )));
        }
        if i64::from(parts.generated_batches) != parts.generation_context.last_batch_index() + 1 {
            return Err(SessionStateError::InvalidPersistedState(
                "generated batch count disagrees with generation context".into(),
            ));
        }

        Ok(Self {
            id: parts.id,
            user_id: parts.user_id,
            kind: parts.kind,
            lifecycle: parts.lifecycle,
            started_at: parts.started_at,
            active_since: parts.active_since,
            time_paused_secs: parts.time_paused_secs,
            time_spent_secs: parts.time_spent_secs,
            remaining_time_secs: parts.remaining_time_secs,
            questions: parts.questions,
            total_questions: parts.total_questions,
            batch_size: parts.batch_size,
            categories: parts.categories,
            generated_batches: parts.generated_batches,
            generation_context: parts.generation_context,
            pending_batch: parts.pending_batch,
            scores: parts.scores,
            revision: parts.revision,
        })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lifecycle.status()
    }

    #[must_use]
    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.paused_at()
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.ended_at()
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Start of the current active stretch (creation or last resume).
    #[must_use]
    pub fn active_since(&self) -> DateTime<Utc> {
        self.active_since
    }

    #[must_use]
    pub fn time_paused_secs(&self) -> u64 {
        self.time_paused_secs
    }

    #[must_use]
    pub fn time_spent_secs(&self) -> u64 {
        self.time_spent_secs
    }

    /// Last persisted countdown snapshot (exam only).
    #[must_use]
    pub fn remaining_time_secs(&self) -> Option<u64> {
        self.remaining_time_secs
    }

    #[must_use]
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    #[must_use]
    pub fn question(&self, index: u32) -> Option<&Question> {
        self.questions.get(usize_from(index))
    }

    #[must_use]
    pub fn total_questions(&self) -> u32 {
        self.total_questions
    }

    #[must_use]
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    #[must_use]
    pub fn generated_batches(&self) -> u32 {
        self.generated_batches
    }

    #[must_use]
    pub fn generation_context(&self) -> &GenerationContext {
        &self.generation_context
    }

    /// The batch a refill is currently generating, if any.
    #[must_use]
    pub fn pending_batch(&self) -> Option<BatchClaim> {
        self.pending_batch
    }

    #[must_use]
    pub fn scores(&self) -> Option<&SessionScores> {
        self.scores.as_ref()
    }

    /// Optimistic-concurrency counter, bumped by storage on every write.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Countdown remaining at `now`. Only the current active stretch is
    /// subtracted; paused and ended sessions report their snapshot.
    #[must_use]
    pub fn remaining_time_at(&self, now: DateTime<Utc>) -> Option<u64> {
        let snapshot = self.remaining_time_secs?;
        match self.lifecycle {
            Lifecycle::InProgress => {
                Some(snapshot.saturating_sub(elapsed_secs(self.active_since, now)))
            }
            _ => Some(snapshot),
        }
    }

    /// Time spent answering at `now`, including the current active stretch.
    #[must_use]
    pub fn time_spent_at(&self, now: DateTime<Utc>) -> u64 {
        match self.lifecycle {
            Lifecycle::InProgress => self
                .time_spent_secs
                .saturating_add(elapsed_secs(self.active_since, now)),
            _ => self.time_spent_secs,
        }
    }

    /// Number of batches needed to reach `total_questions`.
    #[must_use]
    pub fn batches_required(&self) -> u32 {
        self.total_questions.div_ceil(self.batch_size)
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> u32 {
        let held = u32::try_from(self.questions.len()).unwrap_or(u32::MAX);
        self.total_questions.saturating_sub(held)
    }

    /// Whether another batch should be generated for this session.
    #[must_use]
    pub fn needs_more_questions(&self) -> bool {
        !self.is_terminal()
            && self.generated_batches < self.batches_required()
            && self.remaining_capacity() > 0
    }

    /// Size to request for the next batch; never more than the remaining capacity.
    #[must_use]
    pub fn next_batch_size(&self) -> u32 {
        self.batch_size.min(self.remaining_capacity())
    }

    #[must_use]
    pub fn next_batch_index(&self) -> u32 {
        self.generation_context.next_batch_index()
    }

    /// Reserve the next batch for generation.
    ///
    /// A live claim held by someone else is reported as `InFlight` and left
    /// untouched; an expired one is replaced.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::Ended` for ended sessions.
    pub fn claim_next_batch(
        &mut self,
        now: DateTime<Utc>,
        lease_secs: u64,
    ) -> Result<BatchClaimOutcome, SessionStateError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(SessionStateError::Ended { status });
        }
        if !self.needs_more_questions() {
            return Ok(BatchClaimOutcome::NotNeeded);
        }
        if let Some(claim) = self.pending_batch.filter(|c| c.is_live(now, lease_secs)) {
            return Ok(BatchClaimOutcome::InFlight(claim));
        }
        let claim = BatchClaim {
            batch_index: self.next_batch_index(),
            claimed_at: now,
        };
        self.pending_batch = Some(claim);
        Ok(BatchClaimOutcome::Claimed(claim))
    }

    /// Drop `claim` if it is still the pending one. Returns whether it was.
    pub fn release_batch(&mut self, claim: BatchClaim) -> bool {
        if self.pending_batch == Some(claim) {
            self.pending_batch = None;
            true
        } else {
            false
        }
    }

    /// # Errors
    ///
    /// Returns `SessionStateError::NotInProgress` unless the session is in progress.
    pub fn ensure_in_progress(&self) -> Result<(), SessionStateError> {
        let status = self.status();
        if status == SessionStatus::InProgress {
            Ok(())
        } else {
            Err(SessionStateError::NotInProgress { status })
        }
    }

    /// `in_progress → paused`.
    ///
    /// Snapshots the caller's countdown (exam) and time spent; missing values
    /// are derived from the clock.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotInProgress` unless the session is in progress.
    pub fn pause(
        &mut self,
        now: DateTime<Utc>,
        snapshot: TimeSnapshot,
    ) -> Result<(), SessionStateError> {
        let next = self.lifecycle.apply(&Transition::Pause, now)?;
        self.capture_time(now, snapshot);
        self.lifecycle = next;
        Ok(())
    }

    /// `paused → in_progress`. Returns the pause duration that was accumulated.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotPaused` unless the session is paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<u64, SessionStateError> {
        let paused_at = self.paused_at();
        let next = self.lifecycle.apply(&Transition::Resume, now)?;
        let pause_secs = paused_at.map_or(0, |at| elapsed_secs(at, now));
        self.time_paused_secs = self.time_paused_secs.saturating_add(pause_secs);
        self.active_since = now;
        self.lifecycle = next;
        Ok(pause_secs)
    }

    /// `in_progress → completed` with the final scores.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotInProgress` unless the session is in progress.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        scores: SessionScores,
        time_spent_secs: Option<u64>,
    ) -> Result<(), SessionStateError> {
        let next = self.lifecycle.apply(&Transition::Complete, now)?;
        self.capture_time(
            now,
            TimeSnapshot {
                remaining_time_secs: None,
                time_spent_secs,
            },
        );
        self.scores = Some(scores);
        self.lifecycle = next;
        Ok(())
    }

    /// Replace the scores of a completed session.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotCompleted` for any other status.
    pub fn rescore(&mut self, scores: SessionScores) -> Result<(), SessionStateError> {
        match self.lifecycle {
            Lifecycle::Completed { .. } => {
                self.scores = Some(scores);
                Ok(())
            }
            _ => Err(SessionStateError::NotCompleted {
                status: self.status(),
            }),
        }
    }

    /// `in_progress → abandoned`. No scores are computed.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotInProgress` unless the session is in progress.
    pub fn abandon(
        &mut self,
        now: DateTime<Utc>,
        time_spent_secs: Option<u64>,
    ) -> Result<(), SessionStateError> {
        let next = self.lifecycle.apply(&Transition::Abandon, now)?;
        self.capture_time(
            now,
            TimeSnapshot {
                remaining_time_secs: None,
                time_spent_secs,
            },
        );
        self.lifecycle = next;
        Ok(())
    }

    /// Any non-terminal state → `failed`.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::Ended` if the session already ended.
    pub fn fail(&mut self, now: DateTime<Utc>, reason: impl Into<String>) -> Result<(), SessionStateError> {
        let next = self.lifecycle.apply(
            &Transition::Fail {
                reason: reason.into(),
            },
            now,
        )?;
        if matches!(self.lifecycle, Lifecycle::InProgress) {
            self.capture_time(now, TimeSnapshot::default());
        }
        self.lifecycle = next;
        Ok(())
    }

    /// Append a generated batch together with the context it produced.
    ///
    /// The batch is truncated to the remaining capacity so the question count
    /// never exceeds `total_questions`. Returns the number of questions kept.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError` if the session ended, is already full, the
    /// batch is out of order, or `context` was not produced by this batch.
    pub fn append_batch(
        &mut self,
        batch_index: u32,
        mut questions: Vec<Question>,
        context: GenerationContext,
    ) -> Result<usize, SessionStateError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(SessionStateError::Ended { status });
        }
        self.generation_context.ensure_next(batch_index)?;
        if context.last_batch_index() != i64::from(batch_index) {
            return Err(SessionStateError::ContextMismatch { batch_index });
        }
        let capacity = usize_from(self.remaining_capacity());
        if capacity == 0 {
            return Err(SessionStateError::Full {
                total: self.total_questions,
            });
        }

        questions.truncate(capacity);
        let kept = questions.len();
        self.questions.extend(questions);
        self.generation_context = context;
        self.generated_batches = self.generated_batches.saturating_add(1);
        self.pending_batch = None;
        Ok(kept)
    }

    /// Grade an answer to the question at `question_index`.
    ///
    /// Answers are only accepted while the session is in progress.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::NotInProgress` or an `AnswerError` for a bad
    /// index or choice.
    pub fn grade_answer(
        &self,
        question_index: u32,
        selected_answer: u8,
        time_spent_secs: u32,
        answered_at: DateTime<Utc>,
    ) -> Result<Answer, SessionStateError> {
        self.ensure_in_progress()?;
        let question = self
            .question(question_index)
            .ok_or(AnswerError::UnknownQuestion {
                index: question_index,
                available: self.questions.len(),
            })?;
        Ok(Answer::grade(
            self.id,
            question_index,
            question,
            selected_answer,
            time_spent_secs,
            answered_at,
        )?)
    }

    /// Bump the revision after a successful persisted write.
    pub fn mark_persisted(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn capture_time(&mut self, now: DateTime<Utc>, snapshot: TimeSnapshot) {
        let remaining = match snapshot.remaining_time_secs {
            Some(value) if self.kind.is_exam() => Some(value),
            _ => self.remaining_time_at(now),
        };
        self.time_spent_secs = snapshot
            .time_spent_secs
            .unwrap_or_else(|| self.time_spent_at(now));
        self.remaining_time_secs = remaining;
    }
}

fn usize_from(value: u32) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::question::QuestionDraft;
    use crate::model::ids::QuestionId;
    use crate::time::fixed_now;
    use chrono::Duration;

    fn question(n: usize) -> Question {
        QuestionDraft {
            id: Some(QuestionId::new(format!("q{n}"))),
            section: Some(Section::Verbal),
            topic: Some("analogy".into()),
            stem: format!("stem {n}"),
            choices: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            answer_index: 0,
            ..QuestionDraft::default()
        }
        .validate()
        .unwrap()
    }

    fn batch(range: std::ops::Range<usize>) -> Vec<Question> {
        range.map(question).collect()
    }

    fn exam(total: u32) -> Session {
        NewSession::new(
            UserId::random(),
            SessionKind::Exam {
                track: Track::Scientific,
            },
            total,
            10,
            Vec::new(),
            fixed_now(),
            7_200,
        )
        .unwrap()
        .into_session(SessionId::new(1))
    }

    fn append(session: &mut Session, questions: Vec<Question>) -> usize {
        let idx = session.next_batch_index();
        let ctx = session
            .generation_context()
            .advance(idx, questions.iter().map(Question::id))
            .unwrap();
        session.append_batch(idx, questions, ctx).unwrap()
    }

    #[test]
    fn transition_table_rejects_illegal_moves() {
        let now = fixed_now();
        let paused = Lifecycle::Paused { paused_at: now };
        let done = Lifecycle::Completed { ended_at: now };

        assert!(matches!(
            paused.apply(&Transition::Complete, now),
            Err(SessionStateError::NotInProgress { status: SessionStatus::Paused })
        ));
        assert!(matches!(
            done.apply(&Transition::Resume, now),
            Err(SessionStateError::NotPaused { status: SessionStatus::Completed })
        ));
        assert!(matches!(
            Lifecycle::InProgress.apply(&Transition::Resume, now),
            Err(SessionStateError::NotPaused { .. })
        ));
        assert!(matches!(
            done.apply(&Transition::Fail { reason: "x".into() }, now),
            Err(SessionStateError::Ended { .. })
        ));
        assert_eq!(
            paused.apply(&Transition::Fail { reason: "x".into() }, now).unwrap().status(),
            SessionStatus::Failed
        );
    }

    #[test]
    fn paused_at_is_set_only_while_paused() {
        let mut s = exam(20);
        let now = fixed_now();
        assert!(s.paused_at().is_none());

        s.pause(now, TimeSnapshot::default()).unwrap();
        assert_eq!(s.status(), SessionStatus::Paused);
        assert_eq!(s.paused_at(), Some(now));

        s.resume(now + Duration::seconds(5)).unwrap();
        assert_eq!(s.status(), SessionStatus::InProgress);
        assert!(s.paused_at().is_none());
    }

    #[test]
    fn pause_then_resume_accumulates_pause_time() {
        let mut s = exam(20);
        let t0 = fixed_now();
        s.pause(
            t0 + Duration::seconds(100),
            TimeSnapshot {
                remaining_time_secs: Some(7_000),
                time_spent_secs: None,
            },
        )
        .unwrap();
        assert_eq!(s.remaining_time_secs(), Some(7_000));
        assert_eq!(s.time_spent_secs(), 100);

        let paused_for = s.resume(t0 + Duration::seconds(130)).unwrap();
        assert_eq!(paused_for, 30);
        assert_eq!(s.time_paused_secs(), 30);

        // countdown resumes from the snapshot, not from the original start
        assert_eq!(s.remaining_time_at(t0 + Duration::seconds(140)), Some(6_990));
    }

    #[test]
    fn practice_ignores_remaining_time_snapshot() {
        let mut s = NewSession::new(
            UserId::random(),
            SessionKind::Practice {
                section: Section::Quantitative,
            },
            10,
            5,
            vec![" ".into()],
            fixed_now(),
            7_200,
        )
        .unwrap()
        .into_session(SessionId::new(2));
        assert_eq!(s.categories(), Section::Quantitative.default_categories());

        s.pause(
            fixed_now(),
            TimeSnapshot {
                remaining_time_secs: Some(50),
                time_spent_secs: Some(42),
            },
        )
        .unwrap();
        assert_eq!(s.remaining_time_secs(), None);
        assert_eq!(s.time_spent_secs(), 42);
    }

    #[test]
    fn complete_requires_in_progress() {
        let mut s = exam(20);
        s.pause(fixed_now(), TimeSnapshot::default()).unwrap();
        let err = s
            .complete(fixed_now(), SessionScores::default(), None)
            .unwrap_err();
        assert!(matches!(err, SessionStateError::NotInProgress { .. }));
        assert_eq!(s.status(), SessionStatus::Paused);
    }

    #[test]
    fn only_completed_sessions_can_be_rescored() {
        let mut s = exam(20);
        let scores = SessionScores {
            overall_score: 80,
            ..SessionScores::default()
        };
        assert!(matches!(
            s.rescore(scores.clone()),
            Err(SessionStateError::NotCompleted { status: SessionStatus::InProgress })
        ));
        s.complete(fixed_now(), SessionScores::default(), None).unwrap();
        s.rescore(scores.clone()).unwrap();
        assert_eq!(s.scores(), Some(&scores));
    }

    #[test]
    fn append_batch_never_exceeds_total() {
        let mut s = exam(15);
        assert_eq!(s.batches_required(), 2);
        assert_eq!(append(&mut s, batch(0..10)), 10);
        assert_eq!(s.next_batch_size(), 5);
        assert!(s.needs_more_questions());

        assert_eq!(append(&mut s, batch(10..20)), 5);
        assert_eq!(s.questions().len(), 15);
        assert_eq!(s.generated_batches(), 2);
        assert!(!s.needs_more_questions());
    }

    #[test]
    fn append_batch_rejects_out_of_order_context() {
        let mut s = exam(30);
        let ctx = GenerationContext::empty().advance(0, Vec::<&QuestionId>::new()).unwrap();
        let err = s.append_batch(1, batch(0..3), ctx.clone()).unwrap_err();
        assert!(matches!(err, SessionStateError::BatchOrder(_)));

        let stale = GenerationContext::empty();
        let err = s.append_batch(0, batch(0..3), stale).unwrap_err();
        assert!(matches!(err, SessionStateError::ContextMismatch { batch_index: 0 }));

        assert_eq!(s.append_batch(0, batch(0..3), ctx).unwrap(), 3);
    }

    #[test]
    fn append_batch_rejected_after_end() {
        let mut s = exam(30);
        s.fail(fixed_now(), "provider down").unwrap();
        let ctx = GenerationContext::empty().advance(0, Vec::<&QuestionId>::new()).unwrap();
        let err = s.append_batch(0, batch(0..3), ctx).unwrap_err();
        assert!(matches!(err, SessionStateError::Ended { status: SessionStatus::Failed }));
        assert_eq!(s.lifecycle().failure_reason(), Some("provider down"));
    }

    #[test]
    fn batch_claim_blocks_a_second_claimer_until_it_expires() {
        let mut s = exam(30);
        append(&mut s, batch(0..10));
        let t0 = fixed_now();

        let BatchClaimOutcome::Claimed(claim) = s.claim_next_batch(t0, 60).unwrap() else {
            panic!("first claim should succeed");
        };
        assert_eq!(claim.batch_index, 1);
        assert_eq!(
            s.claim_next_batch(t0 + Duration::seconds(10), 60).unwrap(),
            BatchClaimOutcome::InFlight(claim)
        );

        let later = t0 + Duration::seconds(61);
        let BatchClaimOutcome::Claimed(takeover) = s.claim_next_batch(later, 60).unwrap() else {
            panic!("expired claim should be replaced");
        };
        assert_eq!(takeover.batch_index, 1);
        assert!(!s.release_batch(claim));
        assert_eq!(s.pending_batch(), Some(takeover));
    }

    #[test]
    fn appending_the_batch_clears_its_claim() {
        let mut s = exam(20);
        append(&mut s, batch(0..10));
        assert!(matches!(
            s.claim_next_batch(fixed_now(), 60).unwrap(),
            BatchClaimOutcome::Claimed(_)
        ));
        append(&mut s, batch(10..20));
        assert_eq!(s.pending_batch(), None);
        assert_eq!(
            s.claim_next_batch(fixed_now(), 60).unwrap(),
            BatchClaimOutcome::NotNeeded
        );

        s.abandon(fixed_now(), None).unwrap();
        assert!(matches!(
            s.claim_next_batch(fixed_now(), 60),
            Err(SessionStateError::Ended { .. })
        ));
    }

    #[test]
    fn grading_requires_an_existing_question() {
        let mut s = exam(30);
        append(&mut s, batch(0..2));
        let answer = s.grade_answer(1, 0, 12, fixed_now()).unwrap();
        assert!(answer.is_correct());

        let err = s.grade_answer(5, 0, 12, fixed_now()).unwrap_err();
        assert!(matches!(
            err,
            SessionStateError::Answer(AnswerError::UnknownQuestion { index: 5, available: 2 })
        ));
    }

    #[test]
    fn track_spreads_quantitative_batches() {
        let quant = (0..10)
            .filter(|i| Track::Scientific.section_for_batch(*i) == Section::Quantitative)
            .count();
        assert_eq!(quant, 6);
        let quant = (0..10)
            .filter(|i| Track::Literary.section_for_batch(*i) == Section::Quantitative)
            .count();
        assert_eq!(quant, 4);
    }

    #[test]
    fn from_persisted_rejects_overfull_session() {
        let s = exam(2);
        let parts = PersistedSession {
            id: s.id(),
            user_id: s.user_id(),
            kind: s.kind(),
            lifecycle: Lifecycle::InProgress,
            started_at: s.started_at(),
            active_since: s.active_since(),
            time_paused_secs: 0,
            time_spent_secs: 0,
            remaining_time_secs: None,
            questions: batch(0..3),
            total_questions: 2,
            batch_size: 10,
            categories: Vec::new(),
            generated_batches: 1,
            generation_context: GenerationContext::empty().advance(0, Vec::<&QuestionId>::new()).unwrap(),
            pending_batch: None,
            scores: None,
            revision: 3,
        };
        assert!(matches!(
            Session::from_persisted(parts),
            Err(SessionStateError::InvalidPersistedState(_))
        ));
    }
}
