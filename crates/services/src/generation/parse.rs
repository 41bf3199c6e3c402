use qudrat_core::model::{Question, QuestionShape, ShapeDefaults};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GenerationError;

#[derive(Deserialize)]
struct Envelope {
    questions: Vec<Value>,
}

/// Parse provider output into validated questions.
///
/// Accepts `{"questions": [...]}` or a bare array, optionally wrapped in a
/// markdown code fence. Items that fail to normalize are skipped.
///
/// # Errors
///
/// Returns `GenerationError::Parse` when the payload is not a question list.
pub fn parse_questions(
    raw: &str,
    defaults: &ShapeDefaults,
) -> Result<Vec<Question>, GenerationError> {
    let body = strip_code_fence(raw);
    let items = match serde_json::from_str::<Value>(body)
        .map_err(|e| GenerationError::Parse(e.to_string()))?
    {
        Value::Array(items) => items,
        object @ Value::Object(_) => {
            serde_json::from_value::<Envelope>(object)
                .map_err(|e| GenerationError::Parse(e.to_string()))?
                .questions
        }
        other => {
            return Err(GenerationError::Parse(format!(
                "expected an object or array, got {}",
                json_kind(&other)
            )));
        }
    };

    let mut questions = Vec::with_capacity(items.len());
    for (position, item) in items.into_iter().enumerate() {
        let normalized = serde_json::from_value::<QuestionShape>(item)
            .map_err(|e| e.to_string())
            .and_then(|shape| shape.normalize(defaults).map_err(|e| e.to_string()));
        match normalized {
            Ok(question) => questions.push(question),
            Err(reason) => {
                tracing::warn!(position, %reason, "skipping malformed generated question");
            }
        }
    }
    Ok(questions)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qudrat_core::model::{Difficulty, Section};

    fn defaults() -> ShapeDefaults {
        ShapeDefaults {
            section: Some(Section::Verbal),
            topic: Some("analogy".into()),
            difficulty: None,
        }
    }

    #[test]
    fn accepts_envelope_inside_code_fence() {
        let raw = "```json\n{\"questions\": [{\"id\": \"q-1\", \"stem\": \"s\", \"choices\": [\"a\",\"b\",\"c\",\"d\"], \"answerIndex\": 2, \"difficulty\": \"hard\"}]}\n```";
        let questions = parse_questions(raw, &defaults()).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].id().as_str(), "q-1");
        assert_eq!(questions[0].answer_index(), 2);
        assert_eq!(questions[0].difficulty(), Difficulty::Hard);
        assert_eq!(questions[0].section(), Section::Verbal);
    }

    #[test]
    fn accepts_bare_array_of_legacy_items() {
        let raw = r#"[{"question_text": "q", "options": ["w","x","y","z"], "correct_answer": "ج", "category": "odd_word"}]"#;
        let questions = parse_questions(raw, &defaults()).unwrap();
        assert_eq!(questions[0].answer_index(), 2);
        assert_eq!(questions[0].topic(), "odd_word");
    }

    #[test]
    fn malformed_items_are_skipped() {
        let raw = r#"{"questions": [
            {"stem": "ok", "choices": ["a","b","c","d"], "answerIndex": 0},
            {"stem": "three choices", "choices": ["a","b","c"], "answerIndex": 0},
            {"nothing": true}
        ]}"#;
        let questions = parse_questions(raw, &defaults()).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].stem(), "ok");
    }

    #[test]
    fn non_json_is_a_parse_error() {
        assert!(matches!(
            parse_questions("sorry, I cannot help", &defaults()),
            Err(GenerationError::Parse(_))
        ));
        assert!(matches!(
            parse_questions("42", &defaults()),
            Err(GenerationError::Parse(_))
        ));
    }
}
