use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qudrat_core::model::{Answer, NewSession, Session, SessionId, SessionStatus, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    /// A conditional write lost against a concurrent writer, or a
    /// create-once row already exists.
    #[error("conflict")]
    Conflict,

    /// The answer's session is no longer in progress.
    #[error("session is not accepting answers")]
    SessionClosed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── SESSIONS & ANSWERS ───────────────────────────────────────────────────────
//

/// Repository contract for the denormalized session row.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session and return it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the session cannot be stored.
    async fn insert_session(&self, session: &NewSession) -> Result<Session, StorageError>;

    /// Fetch a session by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Conditionally overwrite a session.
    ///
    /// The write only applies when the stored revision still equals
    /// `session.revision()`. Returns the new revision.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` when another writer committed first,
    /// `StorageError::NotFound` when the session does not exist.
    async fn update_session(&self, session: &Session) -> Result<u64, StorageError>;

    /// List a user's sessions, most recently started first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<Session>, StorageError>;
}

#[async_trait]
pub trait AnswerRepository: Send + Sync {
    /// Store an answer. Answers are create-once per `(session, question_index)`
    /// and are only accepted while the stored session is in progress; the
    /// status check and the insert are one atomic step.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the question was already answered,
    /// `StorageError::SessionClosed` if the session is missing or not in progress.
    async fn insert_answer(&self, answer: &Answer) -> Result<(), StorageError>;

    /// All answers of a session ordered by question index.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn list_answers(&self, session_id: SessionId) -> Result<Vec<Answer>, StorageError>;
}

//
// ─── GENERATION LOG ───────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Started,
    Succeeded,
    Failed,
}

/// A batch generation about to be sent to the provider.
#[derive(Debug, Clone)]
pub struct NewGenerationLog {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub batch_index: u32,
    pub requested: u32,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

/// Outcome recorded once the provider call finished.
#[derive(Debug, Clone, Default)]
pub struct GenerationCompletion {
    pub succeeded: bool,
    pub duration_ms: u64,
    pub question_count: u32,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub cached_tokens: Option<u32>,
    pub cache_hit: bool,
    pub cost_micro_usd: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLogRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub batch_index: u32,
    pub requested: u32,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub status: GenerationStatus,
    pub duration_ms: Option<u64>,
    pub question_count: u32,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub cached_tokens: Option<u32>,
    pub cache_hit: bool,
    pub cost_micro_usd: Option<u64>,
    pub error: Option<String>,
}

impl GenerationLogRecord {
    fn started(id: i64, record: NewGenerationLog) -> Self {
        Self {
            id,
            session_id: record.session_id,
            user_id: record.user_id,
            batch_index: record.batch_index,
            requested: record.requested,
            provider: record.provider,
            model: record.model,
            started_at: record.started_at,
            status: GenerationStatus::Started,
            duration_ms: None,
            question_count: 0,
            prompt_tokens: None,
            completion_tokens: None,
            cached_tokens: None,
            cache_hit: false,
            cost_micro_usd: None,
            error: None,
        }
    }

    fn apply(&mut self, completion: GenerationCompletion) {
        self.status = if completion.succeeded {
            GenerationStatus::Succeeded
        } else {
            GenerationStatus::Failed
        };
        self.duration_ms = Some(completion.duration_ms);
        self.question_count = completion.question_count;
        self.prompt_tokens = completion.prompt_tokens;
        self.completion_tokens = completion.completion_tokens;
        self.cached_tokens = completion.cached_tokens;
        self.cache_hit = completion.cache_hit;
        self.cost_micro_usd = completion.cost_micro_usd;
        self.error = completion.error;
    }
}

/// Repository contract for per-batch generation logs.
///
/// Doubles as the shared store behind generation budgets, so limits hold
/// across every process that talks to the same database.
#[async_trait]
pub trait GenerationLogRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be stored.
    async fn insert_started(&self, record: NewGenerationLog) -> Result<i64, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown log id.
    async fn update_completion(
        &self,
        id: i64,
        completion: GenerationCompletion,
    ) -> Result<(), StorageError>;

    /// Number of batches started by `user_id` since `since`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn count_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn last_started_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn sum_cost_since(&self, since: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Logs of one session ordered by batch index, then id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn list_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<GenerationLogRecord>, StorageError>;
}

//
// ─── PRICE BOOK ───────────────────────────────────────────────────────────────
//

/// Provider pricing in micro-USD per million tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBookEntry {
    pub provider: String,
    pub model: String,
    pub input_micro_usd_per_million: u64,
    /// Rate for prompt tokens served from the provider's prompt cache.
    pub cached_input_micro_usd_per_million: u64,
    pub output_micro_usd_per_million: u64,
    pub deprecated: bool,
}

#[async_trait]
pub trait PriceBookRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn get_entry(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Option<PriceBookEntry>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn list_entries(&self) -> Result<Vec<PriceBookEntry>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be stored.
    async fn upsert_entry(&self, entry: &PriceBookEntry) -> Result<(), StorageError>;
}

//
// ─── IN-MEMORY ────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct MemoryState {
    next_session_id: u64,
    sessions: HashMap<SessionId, Session>,
    answers: HashMap<(SessionId, u32), Answer>,
    logs: Vec<GenerationLogRecord>,
    prices: HashMap<(String, String), PriceBookEntry>,
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// One mutex guards all tables, so conditional writes are linearizable.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        f(&mut guard)
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn insert_session(&self, session: &NewSession) -> Result<Session, StorageError> {
        self.with_state(|state| {
            state.next_session_id += 1;
            let created = session
                .clone()
                .into_session(SessionId::new(state.next_session_id));
            state.sessions.insert(created.id(), created.clone());
            Ok(created)
        })
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        self.with_state(|state| Ok(state.sessions.get(&id).cloned()))
    }

    async fn update_session(&self, session: &Session) -> Result<u64, StorageError> {
        self.with_state(|state| {
            let stored = state
                .sessions
                .get_mut(&session.id())
                .ok_or(StorageError::NotFound)?;
            if stored.revision() != session.revision() {
                return Err(StorageError::Conflict);
            }
            let revision = session.revision() + 1;
            let mut next = session.clone();
            next.mark_persisted(revision);
            *stored = next;
            Ok(revision)
        })
    }

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<Session>, StorageError> {
        self.with_state(|state| {
            let mut sessions: Vec<Session> = state
                .sessions
                .values()
                .filter(|s| s.user_id() == user_id)
                .cloned()
                .collect();
            sessions.sort_by(|a, b| {
                b.started_at()
                    .cmp(&a.started_at())
                    .then_with(|| b.id().cmp(&a.id()))
            });
            sessions.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(sessions)
        })
    }
}

#[async_trait]
impl AnswerRepository for InMemoryRepository {
    async fn insert_answer(&self, answer: &Answer) -> Result<(), StorageError> {
        self.with_state(|state| {
            let open = state
                .sessions
                .get(&answer.session_id())
                .is_some_and(|s| s.status() == SessionStatus::InProgress);
            if !open {
                return Err(StorageError::SessionClosed);
            }
            let key = (answer.session_id(), answer.question_index());
            if state.answers.contains_key(&key) {
                return Err(StorageError::Conflict);
            }
            state.answers.insert(key, answer.clone());
            Ok(())
        })
    }

    async fn list_answers(&self, session_id: SessionId) -> Result<Vec<Answer>, StorageError> {
        self.with_state(|state| {
            let mut answers: Vec<Answer> = state
                .answers
                .values()
                .filter(|a| a.session_id() == session_id)
                .cloned()
                .collect();
            answers.sort_by_key(Answer::question_index);
            Ok(answers)
        })
    }
}

#[async_trait]
impl GenerationLogRepository for InMemoryRepository {
    async fn insert_started(&self, record: NewGenerationLog) -> Result<i64, StorageError> {
        self.with_state(|state| {
            let id = i64::try_from(state.logs.len() + 1)
                .map_err(|_| StorageError::Serialization("log id overflow".into()))?;
            state.logs.push(GenerationLogRecord::started(id, record));
            Ok(id)
        })
    }

    async fn update_completion(
        &self,
        id: i64,
        completion: GenerationCompletion,
    ) -> Result<(), StorageError> {
        self.with_state(|state| {
            let log = state
                .logs
                .iter_mut()
                .find(|log| log.id == id)
                .ok_or(StorageError::NotFound)?;
            log.apply(completion);
            Ok(())
        })
    }

    async fn count_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        self.with_state(|state| {
            let count = state
                .logs
                .iter()
                .filter(|log| log.user_id == user_id && log.started_at >= since)
                .count();
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    async fn last_started_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.with_state(|state| {
            Ok(state
                .logs
                .iter()
                .filter(|log| log.user_id == user_id)
                .map(|log| log.started_at)
                .max())
        })
    }

    async fn sum_cost_since(&self, since: DateTime<Utc>) -> Result<u64, StorageError> {
        self.with_state(|state| {
            Ok(state
                .logs
                .iter()
                .filter(|log| log.started_at >= since)
                .filter_map(|log| log.cost_micro_usd)
                .fold(0_u64, u64::saturating_add))
        })
    }

    async fn list_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<GenerationLogRecord>, StorageError> {
        self.with_state(|state| {
            let mut logs: Vec<GenerationLogRecord> = state
                .logs
                .iter()
                .filter(|log| log.session_id == session_id)
                .cloned()
                .collect();
            logs.sort_by_key(|log| (log.batch_index, log.id));
            Ok(logs)
        })
    }
}

#[async_trait]
impl PriceBookRepository for InMemoryRepository {
    async fn get_entry(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Option<PriceBookEntry>, StorageError> {
        self.with_state(|state| {
            Ok(state
                .prices
                .get(&(provider.to_string(), model.to_string()))
                .cloned())
        })
    }

    async fn list_entries(&self) -> Result<Vec<PriceBookEntry>, StorageError> {
        self.with_state(|state| {
            let mut entries: Vec<PriceBookEntry> = state.prices.values().cloned().collect();
            entries.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
            Ok(entries)
        })
    }

    async fn upsert_entry(&self, entry: &PriceBookEntry) -> Result<(), StorageError> {
        self.with_state(|state| {
            state.prices.insert(
                (entry.provider.clone(), entry.model.clone()),
                entry.clone(),
            );
            Ok(())
        })
    }
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionRepository>,
    pub answers: Arc<dyn AnswerRepository>,
    pub generation_logs: Arc<dyn GenerationLogRepository>,
    pub price_book: Arc<dyn PriceBookRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        Self {
            sessions: Arc::new(repo.clone()),
            answers: Arc::new(repo.clone()),
            generation_logs: Arc::new(repo.clone()),
            price_book: Arc::new(repo),
        }
    }
}
