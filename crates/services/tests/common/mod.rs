#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qudrat_core::model::{Answer, NewSession, Question, Session, SessionId, UserId};
use qudrat_core::time::fixed_now;
use services::generation::{ProviderRequest, ProviderResponse, QuestionProvider, TokenUsage};
use services::{AppServices, Clock, GenerationError, ServiceConfig, SessionService};
use storage::repository::{
    AnswerRepository, InMemoryRepository, SessionRepository, Storage, StorageError,
};

/// Returns `questions_per_call` fresh questions per request, or fails on demand.
pub struct ScriptedProvider {
    calls: AtomicU32,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    questions_per_call: u32,
}

impl ScriptedProvider {
    pub fn new(questions_per_call: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            questions_per_call,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every later call waits this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn payload(&self, call: u32) -> String {
        let items: Vec<String> = (0..self.questions_per_call)
            .map(|i| {
                format!(
                    r#"{{"id": "c{call}-q{i}", "stem": "question {i} of call {call}", "choices": ["w1", "right", "w2", "w3"], "answerIndex": 1, "explanation": "the second choice"}}"#
                )
            })
            .collect();
        format!(r#"{{"questions": [{}]}}"#, items.join(","))
    }
}

#[async_trait]
impl QuestionProvider for ScriptedProvider {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(ProviderResponse {
            content: self.payload(call),
            usage: TokenUsage {
                prompt_tokens: Some(1_200),
                completion_tokens: Some(800),
                cached_tokens: (call > 0).then_some(1_024),
            },
        })
    }
}

/// Shared in-memory storage; services are built per simulated instant.
pub struct Harness {
    pub repo: InMemoryRepository,
    pub provider: Arc<ScriptedProvider>,
    pub config: ServiceConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Self {
            repo: InMemoryRepository::new(),
            provider: Arc::new(ScriptedProvider::new(config.batch_size)),
            config,
        }
    }

    pub fn storage(&self) -> Storage {
        Storage {
            sessions: Arc::new(self.repo.clone()),
            answers: Arc::new(self.repo.clone()),
            generation_logs: Arc::new(self.repo.clone()),
            price_book: Arc::new(self.repo.clone()),
        }
    }

    /// Session service whose clock reads `secs` seconds after the fixed start.
    pub fn service_at(&self, secs: i64) -> Arc<SessionService> {
        let clock = Clock::fixed(fixed_now()).advanced_by_secs(secs);
        AppServices::new(
            self.storage(),
            self.provider.clone(),
            clock,
            self.config.clone(),
        )
        .sessions()
    }

    /// Like [`Harness::service_at`], with session reads and writes routed
    /// through `sessions`.
    pub fn service_with_sessions(
        &self,
        secs: i64,
        sessions: Arc<dyn SessionRepository>,
    ) -> Arc<SessionService> {
        let clock = Clock::fixed(fixed_now()).advanced_by_secs(secs);
        let storage = Storage {
            sessions,
            ..self.storage()
        };
        AppServices::new(storage, self.provider.clone(), clock, self.config.clone()).sessions()
    }

    pub async fn stored(&self, id: SessionId) -> Session {
        self.repo.get_session(id).await.unwrap().unwrap()
    }

    pub async fn stored_question(&self, id: SessionId, index: u32) -> Question {
        self.stored(id).await.question(index).unwrap().clone()
    }
}

/// A change made by another request at an inconvenient moment.
pub enum Interference {
    /// Commit this session version just before the next update.
    Write(Session),
    /// Store this answer just before the next update.
    Answer(Answer),
    /// Fail the next update.
    FailWrite(String),
    /// Serve this snapshot to the next read instead of the stored row.
    StaleRead(Session),
}

impl Interference {
    fn on_read(&self) -> bool {
        matches!(self, Interference::StaleRead(_))
    }
}

/// Session repository that injects one [`Interference`], then behaves normally.
pub struct InterferingSessions {
    inner: InMemoryRepository,
    pending: Mutex<Option<Interference>>,
}

impl InterferingSessions {
    pub fn new(inner: InMemoryRepository, interference: Interference) -> Self {
        Self {
            inner,
            pending: Mutex::new(Some(interference)),
        }
    }

    pub fn fired(&self) -> bool {
        self.pending.lock().unwrap().is_none()
    }

    fn take(&self, on_read: bool) -> Option<Interference> {
        let mut pending = self.pending.lock().unwrap();
        if pending.as_ref().is_some_and(|i| i.on_read() == on_read) {
            pending.take()
        } else {
            None
        }
    }
}

#[async_trait]
impl SessionRepository for InterferingSessions {
    async fn insert_session(&self, session: &NewSession) -> Result<Session, StorageError> {
        self.inner.insert_session(session).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        if let Some(Interference::StaleRead(snapshot)) = self.take(true) {
            return Ok(Some(snapshot));
        }
        self.inner.get_session(id).await
    }

    async fn update_session(&self, session: &Session) -> Result<u64, StorageError> {
        match self.take(false) {
            Some(Interference::Write(competing)) => {
                self.inner.update_session(&competing).await?;
            }
            Some(Interference::Answer(answer)) => self.inner.insert_answer(&answer).await?,
            Some(Interference::FailWrite(reason)) => return Err(StorageError::Connection(reason)),
            Some(Interference::StaleRead(_)) | None => {}
        }
        self.inner.update_session(session).await
    }

    async fn list_sessions_for_user(
        &self,
        user_id: UserId,
        limit: u32,
    ) -> Result<Vec<Session>, StorageError> {
        self.inner.list_sessions_for_user(user_id, limit).await
    }
}
