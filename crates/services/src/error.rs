//! Shared error types for the services crate.

use thiserror::Error;

use qudrat_core::model::{GenerationContextError, SessionStateError};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted while producing a batch of questions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GenerationError {
    #[error("invalid batch request: {0}")]
    InvalidParams(&'static str),
    #[error(transparent)]
    BatchOrder(#[from] GenerationContextError),
    #[error("question provider is not configured")]
    Disabled,
    #[error("provider request failed with status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("provider returned an empty response")]
    EmptyResponse,
    #[error("provider did not answer within {secs}s")]
    Timeout { secs: u64 },
    #[error("provider output is not valid question JSON: {0}")]
    Parse(String),
    #[error("provider returned no usable questions")]
    EmptyBatch,
    #[error(transparent)]
    Budget(#[from] BudgetError),
}

/// Errors emitted by the generation budget.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BudgetError {
    #[error("daily generation cap of {cap} batches reached")]
    DailyCapReached { cap: u32 },
    #[error("generation cooldown active for {remaining_secs}s")]
    CooldownActive { remaining_secs: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while reading `ServiceConfig`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {raw:?}")]
    InvalidNumber { var: &'static str, raw: String },
    #[error("invalid provider base url {raw:?}: {source}")]
    InvalidBaseUrl {
        raw: String,
        #[source]
        source: url::ParseError,
    },
    #[error("QUDRAT_AI_API_KEY is not set")]
    MissingApiKey,
}

/// Errors emitted by session services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session belongs to another user")]
    Forbidden,
    #[error(transparent)]
    InvalidState(SessionStateError),
    #[error("question {question_index} was already answered")]
    AlreadyAnswered { question_index: u32 },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Generation(GenerationError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("session was modified concurrently")]
    Conflict,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SessionStateError> for SessionError {
    fn from(err: SessionStateError) -> Self {
        match err {
            SessionStateError::Answer(answer) => SessionError::Validation(answer.to_string()),
            SessionStateError::InvalidSetup(reason) => SessionError::Validation(reason.into()),
            other => SessionError::InvalidState(other),
        }
    }
}

impl From<GenerationError> for SessionError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Budget(budget) => SessionError::Budget(budget),
            GenerationError::InvalidParams(reason) => SessionError::Validation(reason.into()),
            other => SessionError::Generation(other),
        }
    }
}

impl SessionError {
    /// Whether the request hit an illegal lifecycle transition.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidState(_) | SessionError::AlreadyAnswered { .. }
        )
    }

    /// Localized message shown to the student.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::NotFound => "الجلسة غير موجودة",
            SessionError::Forbidden => "لا تملك صلاحية الوصول إلى هذه الجلسة",
            SessionError::InvalidState(state) => match state {
                SessionStateError::NotInProgress { .. } => "الاختبار ليس قيد التقدم",
                SessionStateError::NotPaused { .. } => "هذه الجلسة ليست متوقفة",
                SessionStateError::Ended { .. } => "انتهت هذه الجلسة",
                SessionStateError::Full { .. } => "اكتملت أسئلة هذه الجلسة",
                _ => "حالة الجلسة لا تسمح بهذا الإجراء",
            },
            SessionError::AlreadyAnswered { .. } => "تمت الإجابة على هذا السؤال مسبقاً",
            SessionError::Validation(_) => "البيانات المدخلة غير صالحة",
            SessionError::Generation(GenerationError::Timeout { .. }) => {
                "استغرق توليد الأسئلة وقتاً طويلاً، حاول مرة أخرى"
            }
            SessionError::Generation(_) => "تعذر توليد الأسئلة، حاول مرة أخرى",
            SessionError::Budget(BudgetError::DailyCapReached { .. }) => {
                "تم بلوغ الحد اليومي لتوليد الأسئلة"
            }
            SessionError::Budget(BudgetError::CooldownActive { .. }) => {
                "يرجى الانتظار قليلاً قبل طلب أسئلة جديدة"
            }
            SessionError::Conflict => "تم تعديل الجلسة من طلب آخر، حاول مرة أخرى",
            SessionError::Budget(_) | SessionError::Storage(_) => "حدث خطأ غير متوقع",
        }
    }
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
