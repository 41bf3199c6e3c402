use std::collections::HashMap;

use chrono::{DateTime, Utc};
use qudrat_core::model::{
    Answer, Difficulty, Question, QuestionId, QuestionType, Section, Session, SessionId,
    SessionKind, SessionScores, SessionStatus, UserId,
};
use serde::Serialize;

use crate::generation::CacheStats;

//
// ─── QUESTIONS ─────────────────────────────────────────────────────────────────
//

/// A question as shown to the student.
///
/// The answer key and explanation are only present once the question has
/// been answered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub index: u32,
    pub id: QuestionId,
    pub section: Section,
    pub topic: String,
    pub difficulty: Difficulty,
    pub question_type: QuestionType,
    pub stem: String,
    pub choices: [String; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagram: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_index: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_answer: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl QuestionView {
    /// Content only, without the answer key.
    #[must_use]
    pub fn stripped(index: u32, question: &Question) -> Self {
        Self {
            index,
            id: question.id().clone(),
            section: question.section(),
            topic: question.topic().to_string(),
            difficulty: question.difficulty(),
            question_type: question.question_type(),
            stem: question.stem().to_string(),
            choices: question.choices().clone(),
            passage: question.passage().map(str::to_string),
            diagram: question.diagram().map(str::to_string),
            answer_index: None,
            selected_answer: None,
            is_correct: None,
            explanation: None,
        }
    }

    /// Content plus the recorded answer and the answer key.
    #[must_use]
    pub fn answered(index: u32, question: &Question, answer: &Answer) -> Self {
        Self {
            answer_index: Some(question.answer_index()),
            selected_answer: Some(answer.selected_answer()),
            is_correct: Some(answer.is_correct()),
            explanation: Some(question.explanation().to_string()),
            ..Self::stripped(index, question)
        }
    }
}

/// Views for the questions starting at `offset`, all stripped.
pub(crate) fn stripped_views(questions: &[Question], offset: usize) -> Vec<QuestionView> {
    questions
        .iter()
        .enumerate()
        .map(|(pos, question)| QuestionView::stripped(index_u32(offset + pos), question))
        .collect()
}

/// Views for every question, revealing the key of answered ones.
pub(crate) fn views_with_answers(questions: &[Question], answers: &[Answer]) -> Vec<QuestionView> {
    let by_index: HashMap<u32, &Answer> = answers
        .iter()
        .map(|answer| (answer.question_index(), answer))
        .collect();
    questions
        .iter()
        .enumerate()
        .map(|(pos, question)| {
            let index = index_u32(pos);
            match by_index.get(&index) {
                Some(answer) => QuestionView::answered(index, question, answer),
                None => QuestionView::stripped(index, question),
            }
        })
        .collect()
}

fn index_u32(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

//
// ─── SESSIONS ──────────────────────────────────────────────────────────────────
//

/// Session metadata with timing evaluated at a given instant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Exam countdown; absent for practice sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time_seconds: Option<u64>,
    pub time_spent_seconds: u64,
    pub time_paused_seconds: u64,
    pub total_questions: u32,
    pub generated_questions: u32,
    pub generated_batches: u32,
    pub needs_more_questions: bool,
    /// Batch a refill is generating right now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generating_batch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<SessionScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SessionSummary {
    #[must_use]
    pub fn at(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            id: session.id(),
            user_id: session.user_id(),
            kind: session.kind(),
            status: session.status(),
            started_at: session.started_at(),
            paused_at: session.paused_at(),
            ended_at: session.ended_at(),
            remaining_time_seconds: session.remaining_time_at(now),
            time_spent_seconds: session.time_spent_at(now),
            time_paused_seconds: session.time_paused_secs(),
            total_questions: session.total_questions(),
            generated_questions: index_u32(session.questions().len()),
            generated_batches: session.generated_batches(),
            needs_more_questions: session.needs_more_questions(),
            generating_batch: session
                .pending_batch()
                .filter(|_| !session.is_terminal())
                .map(|claim| claim.batch_index),
            scores: session.scores().cloned(),
            failure_reason: session.lifecycle().failure_reason().map(str::to_string),
        }
    }
}

/// A session together with every question, keyed answers revealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: SessionSummary,
    pub questions: Vec<QuestionView>,
    pub answered_count: u32,
}

/// Result of creating a session: its summary and the stripped first batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session: SessionSummary,
    pub questions: Vec<QuestionView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResult {
    pub session: SessionSummary,
    pub questions: Vec<QuestionView>,
    pub answers: Vec<AnswerView>,
    pub needs_more_questions: bool,
    /// The session was already running; nothing was written.
    pub already_resumed: bool,
}

/// Graded answer returned right after submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerView {
    pub question_index: u32,
    pub selected_answer: u8,
    pub is_correct: bool,
    pub correct_answer: u8,
    pub explanation: String,
    pub time_spent_seconds: u32,
    pub answered_at: DateTime<Utc>,
}

impl AnswerView {
    #[must_use]
    pub fn new(answer: &Answer, question: &Question) -> Self {
        Self {
            question_index: answer.question_index(),
            selected_answer: answer.selected_answer(),
            is_correct: answer.is_correct(),
            correct_answer: question.answer_index(),
            explanation: question.explanation().to_string(),
            time_spent_seconds: answer.time_spent_secs(),
            answered_at: answer.answered_at(),
        }
    }
}

/// Answers of a session that still point at a stored question.
pub(crate) fn answer_views(session: &Session, answers: &[Answer]) -> Vec<AnswerView> {
    answers
        .iter()
        .filter_map(|answer| {
            session
                .question(answer.question_index())
                .map(|question| AnswerView::new(answer, question))
        })
        .collect()
}

/// Questions appended by a refill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefillResult {
    pub session: SessionSummary,
    pub questions: Vec<QuestionView>,
    /// `None` when the session already held every batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
}

/// Generation statistics of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub cache: CacheStats,
    pub cache_hit_rate_percent: u32,
    pub cost_today_micro_usd: u64,
}
