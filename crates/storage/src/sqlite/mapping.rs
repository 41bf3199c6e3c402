use chrono::{DateTime, Utc};
use qudrat_core::model::{
    Answer, BatchClaim, GenerationContext, Lifecycle, PersistedSession, Question, QuestionShape, Section,
    Session, SessionId, SessionKind, SessionScores, ShapeDefaults, Track, UserId,
};
use sqlx::Row;
use uuid::Uuid;

use crate::repository::{GenerationLogRecord, GenerationStatus, PriceBookEntry, StorageError};

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn i64_to_u32(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn u64_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn session_id_to_i64(id: SessionId) -> Result<i64, StorageError> {
    u64_to_i64("session_id", id.value())
}

pub(crate) fn session_id_from_i64(v: i64) -> Result<SessionId, StorageError> {
    Ok(SessionId::new(i64_to_u64("session_id", v)?))
}

pub(crate) fn user_id_to_text(id: UserId) -> String {
    id.value().to_string()
}

fn user_id_from_text(raw: &str) -> Result<UserId, StorageError> {
    Uuid::parse_str(raw).map(UserId::new).map_err(ser)
}

//
// ─── SESSIONS ─────────────────────────────────────────────────────────────────
//

/// `(kind, track, section)` column values.
pub(crate) fn kind_columns(
    kind: SessionKind,
) -> (&'static str, Option<&'static str>, Option<&'static str>) {
    match kind {
        SessionKind::Exam { track } => ("exam", Some(track.as_str()), None),
        SessionKind::Practice { section } => ("practice", None, Some(section.as_str())),
    }
}

fn parse_kind(
    kind: &str,
    track: Option<&str>,
    section: Option<&str>,
) -> Result<SessionKind, StorageError> {
    match kind {
        "exam" => track
            .and_then(Track::from_label)
            .map(|track| SessionKind::Exam { track })
            .ok_or_else(|| StorageError::Serialization(format!("invalid track: {track:?}"))),
        "practice" => section
            .and_then(Section::from_label)
            .map(|section| SessionKind::Practice { section })
            .ok_or_else(|| StorageError::Serialization(format!("invalid section: {section:?}"))),
        other => Err(StorageError::Serialization(format!("invalid kind: {other}"))),
    }
}

fn parse_lifecycle(
    status: &str,
    paused_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
) -> Result<Lifecycle, StorageError> {
    let missing = |field: &str| StorageError::Serialization(format!("{status} session without {field}"));
    match status {
        "in_progress" => Ok(Lifecycle::InProgress),
        "paused" => Ok(Lifecycle::Paused {
            paused_at: paused_at.ok_or_else(|| missing("paused_at"))?,
        }),
        "completed" => Ok(Lifecycle::Completed {
            ended_at: ended_at.ok_or_else(|| missing("ended_at"))?,
        }),
        "abandoned" => Ok(Lifecycle::Abandoned {
            ended_at: ended_at.ok_or_else(|| missing("ended_at"))?,
        }),
        "failed" => Ok(Lifecycle::Failed {
            ended_at: ended_at.ok_or_else(|| missing("ended_at"))?,
            reason: failure_reason.unwrap_or_default(),
        }),
        other => Err(StorageError::Serialization(format!("invalid status: {other}"))),
    }
}

/// JSON column values of a session: categories, questions, context, scores.
pub(crate) struct SessionDocuments {
    pub categories: String,
    pub questions: String,
    pub generation_context: String,
    pub scores: Option<String>,
}

impl SessionDocuments {
    pub(crate) fn encode(
        categories: &[String],
        questions: &[Question],
        generation_context: &GenerationContext,
        scores: Option<&SessionScores>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            categories: serde_json::to_string(categories).map_err(ser)?,
            questions: serde_json::to_string(questions).map_err(ser)?,
            generation_context: serde_json::to_string(generation_context).map_err(ser)?,
            scores: scores.map(serde_json::to_string).transpose().map_err(ser)?,
        })
    }

    pub(crate) fn of(session: &Session) -> Result<Self, StorageError> {
        Self::encode(
            session.categories(),
            session.questions(),
            session.generation_context(),
            session.scores(),
        )
    }
}

fn decode_questions(raw: &str) -> Result<Vec<Question>, StorageError> {
    let shapes: Vec<QuestionShape> = serde_json::from_str(raw).map_err(ser)?;
    let defaults = ShapeDefaults::default();
    shapes
        .into_iter()
        .map(|shape| shape.normalize(&defaults).map_err(ser))
        .collect()
}

pub(crate) fn map_session_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, StorageError> {
    let kind = parse_kind(
        row.try_get::<String, _>("kind").map_err(ser)?.as_str(),
        row.try_get::<Option<String>, _>("track").map_err(ser)?.as_deref(),
        row.try_get::<Option<String>, _>("section").map_err(ser)?.as_deref(),
    )?;
    let lifecycle = parse_lifecycle(
        row.try_get::<String, _>("status").map_err(ser)?.as_str(),
        row.try_get("paused_at").map_err(ser)?,
        row.try_get("ended_at").map_err(ser)?,
        row.try_get("failure_reason").map_err(ser)?,
    )?;

    let categories: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("categories").map_err(ser)?)
            .map_err(ser)?;
    let questions = decode_questions(&row.try_get::<String, _>("questions").map_err(ser)?)?;
    let generation_context: GenerationContext =
        serde_json::from_str(&row.try_get::<String, _>("generation_context").map_err(ser)?)
            .map_err(ser)?;
    let pending_batch = match (
        row.try_get::<Option<i64>, _>("pending_batch_index").map_err(ser)?,
        row.try_get::<Option<DateTime<Utc>>, _>("pending_batch_claimed_at")
            .map_err(ser)?,
    ) {
        (Some(index), Some(claimed_at)) => Some(BatchClaim {
            batch_index: i64_to_u32("pending_batch_index", index)?,
            claimed_at,
        }),
        _ => None,
    };
    let scores: Option<SessionScores> = row
        .try_get::<Option<String>, _>("scores")
        .map_err(ser)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(ser)?;

    Session::from_persisted(PersistedSession {
        id: session_id_from_i64(row.try_get("id").map_err(ser)?)?,
        user_id: user_id_from_text(&row.try_get::<String, _>("user_id").map_err(ser)?)?,
        kind,
        lifecycle,
        started_at: row.try_get("started_at").map_err(ser)?,
        active_since: row.try_get("active_since").map_err(ser)?,
        time_paused_secs: i64_to_u64(
            "time_paused_secs",
            row.try_get("time_paused_secs").map_err(ser)?,
        )?,
        time_spent_secs: i64_to_u64(
            "time_spent_secs",
            row.try_get("time_spent_secs").map_err(ser)?,
        )?,
        remaining_time_secs: row
            .try_get::<Option<i64>, _>("remaining_time_secs")
            .map_err(ser)?
            .map(|v| i64_to_u64("remaining_time_secs", v))
            .transpose()?,
        questions,
        total_questions: i64_to_u32(
            "total_questions",
            row.try_get("total_questions").map_err(ser)?,
        )?,
        batch_size: i64_to_u32("batch_size", row.try_get("batch_size").map_err(ser)?)?,
        categories,
        generated_batches: i64_to_u32(
            "generated_batches",
            row.try_get("generated_batches").map_err(ser)?,
        )?,
        generation_context,
        pending_batch,
        scores,
        revision: i64_to_u64("revision", row.try_get("revision").map_err(ser)?)?,
    })
    .map_err(ser)
}

//
// ─── ANSWERS ──────────────────────────────────────────────────────────────────
//

pub(crate) fn map_answer_row(row: &sqlx::sqlite::SqliteRow) -> Result<Answer, StorageError> {
    let selected: i64 = row.try_get("selected_answer").map_err(ser)?;
    let selected = u8::try_from(selected)
        .map_err(|_| StorageError::Serialization(format!("invalid selected_answer: {selected}")))?;
    let is_correct: i64 = row.try_get("is_correct").map_err(ser)?;

    Answer::from_persisted(
        session_id_from_i64(row.try_get("session_id").map_err(ser)?)?,
        i64_to_u32("question_index", row.try_get("question_index").map_err(ser)?)?,
        selected,
        is_correct != 0,
        i64_to_u32("time_spent_secs", row.try_get("time_spent_secs").map_err(ser)?)?,
        row.try_get("answered_at").map_err(ser)?,
    )
    .map_err(ser)
}

//
// ─── GENERATION LOGS & PRICES ─────────────────────────────────────────────────
//

pub(crate) fn status_to_str(status: GenerationStatus) -> &'static str {
    match status {
        GenerationStatus::Started => "started",
        GenerationStatus::Succeeded => "succeeded",
        GenerationStatus::Failed => "failed",
    }
}

fn parse_generation_status(s: &str) -> Result<GenerationStatus, StorageError> {
    match s {
        "started" => Ok(GenerationStatus::Started),
        "succeeded" => Ok(GenerationStatus::Succeeded),
        "failed" => Ok(GenerationStatus::Failed),
        other => Err(StorageError::Serialization(format!(
            "invalid generation status: {other}"
        ))),
    }
}

fn optional_u32(
    row: &sqlx::sqlite::SqliteRow,
    field: &'static str,
) -> Result<Option<u32>, StorageError> {
    row.try_get::<Option<i64>, _>(field)
        .map_err(ser)?
        .map(|v| i64_to_u32(field, v))
        .transpose()
}

fn optional_u64(
    row: &sqlx::sqlite::SqliteRow,
    field: &'static str,
) -> Result<Option<u64>, StorageError> {
    row.try_get::<Option<i64>, _>(field)
        .map_err(ser)?
        .map(|v| i64_to_u64(field, v))
        .transpose()
}

pub(crate) fn map_generation_log_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<GenerationLogRecord, StorageError> {
    let cache_hit: i64 = row.try_get("cache_hit").map_err(ser)?;
    Ok(GenerationLogRecord {
        id: row.try_get("id").map_err(ser)?,
        session_id: session_id_from_i64(row.try_get("session_id").map_err(ser)?)?,
        user_id: user_id_from_text(&row.try_get::<String, _>("user_id").map_err(ser)?)?,
        batch_index: i64_to_u32("batch_index", row.try_get("batch_index").map_err(ser)?)?,
        requested: i64_to_u32("requested", row.try_get("requested").map_err(ser)?)?,
        provider: row.try_get("provider").map_err(ser)?,
        model: row.try_get("model").map_err(ser)?,
        started_at: row.try_get("started_at").map_err(ser)?,
        status: parse_generation_status(&row.try_get::<String, _>("status").map_err(ser)?)?,
        duration_ms: optional_u64(row, "duration_ms")?,
        question_count: i64_to_u32("question_count", row.try_get("question_count").map_err(ser)?)?,
        prompt_tokens: optional_u32(row, "prompt_tokens")?,
        completion_tokens: optional_u32(row, "completion_tokens")?,
        cached_tokens: optional_u32(row, "cached_tokens")?,
        cache_hit: cache_hit != 0,
        cost_micro_usd: optional_u64(row, "cost_micro_usd")?,
        error: row.try_get("error").map_err(ser)?,
    })
}

pub(crate) fn map_price_row(row: &sqlx::sqlite::SqliteRow) -> Result<PriceBookEntry, StorageError> {
    let deprecated: i64 = row.try_get("deprecated").map_err(ser)?;
    Ok(PriceBookEntry {
        provider: row.try_get("provider").map_err(ser)?,
        model: row.try_get("model").map_err(ser)?,
        input_micro_usd_per_million: i64_to_u64(
            "input price",
            row.try_get("input_micro_usd_per_million").map_err(ser)?,
        )?,
        cached_input_micro_usd_per_million: i64_to_u64(
            "cached input price",
            row.try_get("cached_input_micro_usd_per_million").map_err(ser)?,
        )?,
        output_micro_usd_per_million: i64_to_u64(
            "output price",
            row.try_get("output_micro_usd_per_million").map_err(ser)?,
        )?,
        deprecated: deprecated != 0,
    })
}
