use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::ids::SessionId;
use crate::model::question::Question;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnswerError {
    #[error("selected answer {0} is not one of the 4 choices")]
    InvalidChoice(u8),

    #[error("question {index} does not exist ({available} generated)")]
    UnknownQuestion { index: u32, available: usize },
}

/// A graded answer to one question of a session.
///
/// Created once when the user submits; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    session_id: SessionId,
    question_index: u32,
    selected_answer: u8,
    is_correct: bool,
    time_spent_secs: u32,
    answered_at: DateTime<Utc>,
}

impl Answer {
    /// Grade `selected_answer` against `question`.
    ///
    /// # Errors
    ///
    /// Returns `AnswerError::InvalidChoice` if the selection is not in `0..4`.
    pub fn grade(
        session_id: SessionId,
        question_index: u32,
        question: &Question,
        selected_answer: u8,
        time_spent_secs: u32,
        answered_at: DateTime<Utc>,
    ) -> Result<Self, AnswerError> {
        if selected_answer >= 4 {
            return Err(AnswerError::InvalidChoice(selected_answer));
        }
        Ok(Self {
            session_id,
            question_index,
            selected_answer,
            is_correct: question.is_correct(selected_answer),
            time_spent_secs,
            answered_at,
        })
    }

    /// Rehydrate an answer from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `AnswerError::InvalidChoice` if the stored selection is out of range.
    pub fn from_persisted(
        session_id: SessionId,
        question_index: u32,
        selected_answer: u8,
        is_correct: bool,
        time_spent_secs: u32,
        answered_at: DateTime<Utc>,
    ) -> Result<Self, AnswerError> {
        if selected_answer >= 4 {
            return Err(AnswerError::InvalidChoice(selected_answer));
        }
        Ok(Self {
            session_id,
            question_index,
            selected_answer,
            is_correct,
            time_spent_secs,
            answered_at,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn question_index(&self) -> u32 {
        self.question_index
    }

    #[must_use]
    pub fn selected_answer(&self) -> u8 {
        self.selected_answer
    }

    #[must_use]
    pub fn is_correct(&self) -> bool {
        self.is_correct
    }

    #[must_use]
    pub fn time_spent_secs(&self) -> u32 {
        self.time_spent_secs
    }

    #[must_use]
    pub fn answered_at(&self) -> DateTime<Utc> {
        self.answered_at
    }
}
