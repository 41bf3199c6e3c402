#![forbid(unsafe_code)]

pub mod app_services;
pub mod config;
pub mod error;
pub mod generation;
pub mod sessions;

pub use qudrat_core::Clock;

pub use app_services::AppServices;
pub use config::{ProviderConfig, ServiceConfig};
pub use error::{AppServicesError, BudgetError, ConfigError, GenerationError, SessionError};
pub use sessions::{
    AnswerView, CreateSession, CreatedSession, FinishAction, RefillResult, ResumeResult,
    SessionDetail, SessionService, SessionSummary, SubmitAnswer,
};
