mod answer;
mod generation;
mod ids;
pub mod question;
pub mod scoring;
mod session;

pub use answer::{Answer, AnswerError};
pub use generation::{GenerationContext, GenerationContextError};
pub use ids::{ParseIdError, QuestionId, SessionId, UserId};
pub use question::{
    Difficulty, Question, QuestionDraft, QuestionError, QuestionShape, QuestionType, Section,
    ShapeDefaults,
};
pub use scoring::{CategoryScore, SessionScores, compute_scores};
pub use session::{
    BatchClaim, BatchClaimOutcome, Lifecycle, NewSession, PersistedSession, Session, SessionKind, SessionStateError,
    SessionStatus, TimeSnapshot, Track, Transition,
};
