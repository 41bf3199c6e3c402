mod lifecycle;
mod resume;
mod view;

// Public API of the session subsystem.
pub use crate::error::SessionError;
pub use lifecycle::{CreateSession, DEFAULT_LIST_LIMIT, FinishAction, SessionService, SubmitAnswer};
pub use view::{
    AnswerView, CreatedSession, GenerationStats, QuestionView, RefillResult, ResumeResult,
    SessionDetail, SessionSummary,
};
