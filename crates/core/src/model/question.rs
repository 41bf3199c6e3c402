use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::QuestionId;

//
// ─── ERRORS ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("question stem cannot be empty")]
    EmptyStem,

    #[error("question must have exactly 4 choices, got {0}")]
    WrongChoiceCount(usize),

    #[error("choice {0} is empty")]
    EmptyChoice(usize),

    #[error("answer index {0} is out of range")]
    AnswerIndexOutOfRange(i64),

    #[error("correct answer {0:?} does not match any choice")]
    UnknownAnswer(String),

    #[error("unknown section: {0}")]
    UnknownSection(String),

    #[error("question has no section")]
    MissingSection,

    #[error("question has no topic")]
    MissingTopic,
}

//
// ─── LABELS ───────────────────────────────────────────────────────────────────
//

/// The two scored sections of the aptitude test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Verbal,
    Quantitative,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Section::Verbal => "verbal",
            Section::Quantitative => "quantitative",
        }
    }

    /// Parses both the English storage labels and the Arabic labels used by
    /// older generated content.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "verbal" | "لفظي" | "اللفظي" => Some(Self::Verbal),
            "quantitative" | "quant" | "math" | "كمي" | "الكمي" => Some(Self::Quantitative),
            _ => None,
        }
    }

    /// Categories used when the caller does not choose any.
    #[must_use]
    pub fn default_categories(self) -> Vec<String> {
        let names: &[&str] = match self {
            Section::Verbal => &[
                "analogy",
                "sentence_completion",
                "contextual_error",
                "reading_comprehension",
                "odd_word",
            ],
            Section::Quantitative => &[
                "arithmetic",
                "algebra",
                "geometry",
                "statistics",
                "comparison",
            ],
        };
        names.iter().map(|name| (*name).to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "easy" | "سهل" => Some(Self::Easy),
            "medium" | "متوسط" => Some(Self::Medium),
            "hard" | "صعب" => Some(Self::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    #[default]
    MultipleChoice,
    /// Quantitative comparison between two quantities.
    Comparison,
    /// Question answered from an attached passage.
    Reading,
}

impl QuestionType {
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "comparison" | "quantitative_comparison" => Self::Comparison,
            "reading" | "reading_comprehension" | "passage" => Self::Reading,
            _ => Self::MultipleChoice,
        }
    }
}

//
// ─── QUESTION ─────────────────────────────────────────────────────────────────
//

/// A generated multiple-choice question in canonical form.
///
/// Immutable once validated; sessions only ever append questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    id: QuestionId,
    section: Section,
    topic: String,
    difficulty: Difficulty,
    question_type: QuestionType,
    stem: String,
    choices: [String; 4],
    answer_index: u8,
    explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    passage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagram: Option<String>,
}

/// Unvalidated question fields.
#[derive(Debug, Clone, Default)]
pub struct QuestionDraft {
    pub id: Option<QuestionId>,
    pub section: Option<Section>,
    pub topic: Option<String>,
    pub difficulty: Difficulty,
    pub question_type: QuestionType,
    pub stem: String,
    pub choices: Vec<String>,
    pub answer_index: i64,
    pub explanation: String,
    pub passage: Option<String>,
    pub diagram: Option<String>,
}

impl QuestionDraft {
    /// Validate and normalize the draft into a `Question`.
    ///
    /// A missing id is replaced by a freshly generated one.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` if the stem or a choice is empty, the choice
    /// count is not 4, the answer index is out of range, or section/topic are missing.
    pub fn validate(self) -> Result<Question, QuestionError> {
        let stem = self.stem.trim().to_string();
        if stem.is_empty() {
            return Err(QuestionError::EmptyStem);
        }

        let choices: [String; 4] = self
            .choices
            .into_iter()
            .map(|choice| choice.trim().to_string())
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|rejected: Vec<String>| QuestionError::WrongChoiceCount(rejected.len()))?;
        if let Some(empty) = choices.iter().position(String::is_empty) {
            return Err(QuestionError::EmptyChoice(empty));
        }

        let answer_index = u8::try_from(self.answer_index)
            .ok()
            .filter(|idx| *idx < 4)
            .ok_or(QuestionError::AnswerIndexOutOfRange(self.answer_index))?;

        let section = self.section.ok_or(QuestionError::MissingSection)?;
        let topic = normalize_optional(self.topic).ok_or(QuestionError::MissingTopic)?;

        Ok(Question {
            id: self.id.unwrap_or_else(QuestionId::generate),
            section,
            topic,
            difficulty: self.difficulty,
            question_type: self.question_type,
            stem,
            choices,
            answer_index,
            explanation: self.explanation.trim().to_string(),
            passage: normalize_optional(self.passage),
            diagram: normalize_optional(self.diagram),
        })
    }
}

impl Question {
    #[must_use]
    pub fn id(&self) -> &QuestionId {
        &self.id
    }

    #[must_use]
    pub fn section(&self) -> Section {
        self.section
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    #[must_use]
    pub fn question_type(&self) -> QuestionType {
        self.question_type
    }

    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    #[must_use]
    pub fn choices(&self) -> &[String; 4] {
        &self.choices
    }

    #[must_use]
    pub fn answer_index(&self) -> u8 {
        self.answer_index
    }

    #[must_use]
    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    #[must_use]
    pub fn passage(&self) -> Option<&str> {
        self.passage.as_deref()
    }

    #[must_use]
    pub fn diagram(&self) -> Option<&str> {
        self.diagram.as_deref()
    }

    #[must_use]
    pub fn is_correct(&self, selected: u8) -> bool {
        selected == self.answer_index
    }

    /// Reorders the choices by `order` (a permutation of `0..4`), keeping the
    /// answer index pointed at the same choice text.
    ///
    /// Returns `None` if `order` is not a permutation.
    #[must_use]
    pub fn with_choice_order(mut self, order: [usize; 4]) -> Option<Self> {
        let mut seen = [false; 4];
        for idx in order {
            if idx >= 4 || seen[idx] {
                return None;
            }
            seen[idx] = true;
        }

        let previous = self.choices.clone();
        for (slot, source) in order.iter().enumerate() {
            self.choices[slot] = previous[*source].clone();
        }
        let new_answer = order
            .iter()
            .position(|source| *source == usize::from(self.answer_index))?;
        self.answer_index = u8::try_from(new_answer).ok()?;
        Some(self)
    }
}

//
// ─── VERSIONED SHAPES ─────────────────────────────────────────────────────────
//

/// Values filled in when a stored or generated shape omits them.
#[derive(Debug, Clone, Default)]
pub struct ShapeDefaults {
    pub section: Option<Section>,
    pub topic: Option<String>,
    pub difficulty: Option<Difficulty>,
}

/// Any question shape the platform has ever produced.
///
/// Resolved once into a canonical `Question` via [`QuestionShape::normalize`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QuestionShape {
    Canonical(CanonicalShape),
    Legacy(LegacyShape),
}

/// Current schema: `stem` / `choices` / `answerIndex`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalShape {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default, alias = "category")]
    pub topic: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default, alias = "question_type", alias = "type")]
    pub question_type: Option<String>,
    pub stem: String,
    pub choices: Vec<String>,
    #[serde(alias = "answer_index")]
    pub answer_index: i64,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub passage: Option<String>,
    #[serde(default)]
    pub diagram: Option<String>,
}

/// First schema: `question_text` / `options` / `correct_answer`.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyShape {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default, alias = "topic")]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default, alias = "type")]
    pub question_type: Option<String>,
    pub question_text: String,
    pub options: Vec<String>,
    pub correct_answer: AnswerKey,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub passage: Option<String>,
    #[serde(default)]
    pub diagram: Option<String>,
}

/// Legacy answer key: an index, a letter, or the text of the correct option.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnswerKey {
    Index(i64),
    Text(String),
}

impl AnswerKey {
    fn resolve(&self, options: &[String]) -> Result<i64, QuestionError> {
        match self {
            AnswerKey::Index(idx) => Ok(*idx),
            AnswerKey::Text(raw) => {
                let text = raw.trim();
                if let Some(pos) = options.iter().position(|opt| opt.trim() == text) {
                    return Ok(index_i64(pos));
                }
                match text {
                    "A" | "a" | "أ" => Ok(0),
                    "B" | "b" | "ب" => Ok(1),
                    "C" | "c" | "ج" => Ok(2),
                    "D" | "d" | "د" => Ok(3),
                    other => other
                        .parse::<i64>()
                        .map_err(|_| QuestionError::UnknownAnswer(raw.clone())),
                }
            }
        }
    }
}

impl QuestionShape {
    /// Converts any known shape into a canonical `Question`.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` when labels cannot be parsed or the resulting
    /// draft fails validation.
    pub fn normalize(self, defaults: &ShapeDefaults) -> Result<Question, QuestionError> {
        let draft = match self {
            QuestionShape::Canonical(shape) => QuestionDraft {
                id: shape.id.map(QuestionId::new),
                section: resolve_section(shape.section.as_deref(), defaults)?,
                topic: shape.topic.or_else(|| defaults.topic.clone()),
                difficulty: resolve_difficulty(shape.difficulty.as_deref(), defaults),
                question_type: shape
                    .question_type
                    .as_deref()
                    .map(QuestionType::from_label)
                    .unwrap_or_default(),
                stem: shape.stem,
                choices: shape.choices,
                answer_index: shape.answer_index,
                explanation: shape.explanation.unwrap_or_default(),
                passage: shape.passage,
                diagram: shape.diagram,
            },
            QuestionShape::Legacy(shape) => {
                let answer_index = shape.correct_answer.resolve(&shape.options)?;
                QuestionDraft {
                    id: shape.id.map(QuestionId::new),
                    section: resolve_section(shape.section.as_deref(), defaults)?,
                    topic: shape.category.or_else(|| defaults.topic.clone()),
                    difficulty: resolve_difficulty(shape.difficulty.as_deref(), defaults),
                    question_type: shape
                        .question_type
                        .as_deref()
                        .map(QuestionType::from_label)
                        .unwrap_or_default(),
                    stem: shape.question_text,
                    choices: shape.options,
                    answer_index,
                    explanation: shape.explanation.unwrap_or_default(),
                    passage: shape.passage,
                    diagram: shape.diagram,
                }
            }
        };
        draft.validate()
    }
}

fn resolve_section(
    label: Option<&str>,
    defaults: &ShapeDefaults,
) -> Result<Option<Section>, QuestionError> {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => Section::from_label(label)
            .map(Some)
            .ok_or_else(|| QuestionError::UnknownSection(label.to_string())),
        None => Ok(defaults.section),
    }
}

fn resolve_difficulty(label: Option<&str>, defaults: &ShapeDefaults) -> Difficulty {
    label
        .and_then(Difficulty::from_label)
        .or(defaults.difficulty)
        .unwrap_or_default()
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}

fn index_i64(pos: usize) -> i64 {
    i64::try_from(pos).unwrap_or(i64::MAX)
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
