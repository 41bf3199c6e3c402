use std::collections::BTreeSet;
use std::fmt::Write as _;

use qudrat_core::model::{Difficulty, QuestionId, Section};

use super::provider::ProviderRequest;

/// Shared by every batch of every session. Keep it byte-stable: the provider's
/// prompt cache keys on this prefix.
pub const SYSTEM_PREFIX: &str = "\
You write practice questions for the Qudrat general aptitude test (GAT).
Write every question in Modern Standard Arabic.

Answer with a single JSON object and nothing else:
{\"questions\": [{
  \"id\": string,
  \"section\": \"verbal\" | \"quantitative\",
  \"topic\": string,
  \"difficulty\": \"easy\" | \"medium\" | \"hard\",
  \"questionType\": \"multiple_choice\" | \"comparison\" | \"reading\",
  \"stem\": string,
  \"choices\": [string, string, string, string],
  \"answerIndex\": 0 | 1 | 2 | 3,
  \"explanation\": string,
  \"passage\": string | null,
  \"diagram\": string | null
}]}

Rules:
- Exactly four distinct choices and exactly one correct answer.
- `id` is a short slug derived from the question content, unique within the test.
- `topic` is one of the categories listed in the request.
- Verbal questions cover analogy, sentence completion, contextual error, reading comprehension and odd word.
- Quantitative questions cover arithmetic, algebra, geometry, statistics and comparison; keep numbers small enough for mental work.
- Comparison questions use the fixed choices: the first quantity is greater, the second quantity is greater, they are equal, the information is insufficient.
- Reading questions carry the passage in `passage`.
- The explanation states why the correct choice is right in one or two sentences.
";

/// Share of easy/medium/hard questions when the caller does not pin a level.
const DEFAULT_MIX: [(Difficulty, u32); 3] = [
    (Difficulty::Easy, 30),
    (Difficulty::Medium, 50),
    (Difficulty::Hard, 20),
];

/// Batch-specific inputs of the user message.
#[derive(Clone, Debug)]
pub struct BatchPrompt<'a> {
    pub batch_index: u32,
    pub count: u32,
    pub section: Section,
    pub categories: &'a [String],
    pub difficulty: Option<Difficulty>,
    pub avoid_ids: &'a BTreeSet<QuestionId>,
}

impl BatchPrompt<'_> {
    #[must_use]
    pub fn to_request(&self) -> ProviderRequest {
        ProviderRequest {
            system: SYSTEM_PREFIX.to_string(),
            user: self.user_message(),
        }
    }

    fn user_message(&self) -> String {
        let mut message = String::new();
        let _ = writeln!(message, "Batch {}.", self.batch_index);
        let _ = writeln!(
            message,
            "Write {} {} questions.",
            self.count,
            self.section.as_str()
        );
        let _ = writeln!(message, "Categories: {}.", self.categories.join(", "));
        let _ = writeln!(message, "Difficulty: {}.", difficulty_line(self.difficulty));
        if !self.avoid_ids.is_empty() {
            let ids: Vec<&str> = self.avoid_ids.iter().map(QuestionId::as_str).collect();
            let _ = writeln!(
                message,
                "Do not repeat these questions (ids): {}.",
                ids.join(", ")
            );
        }
        message
    }
}

fn difficulty_line(difficulty: Option<Difficulty>) -> String {
    match difficulty {
        Some(level) => format!("all {}", level.as_str()),
        None => DEFAULT_MIX
            .iter()
            .map(|(level, share)| format!("{share}% {}", level.as_str()))
            .collect::<Vec<_>>()
            .join(", "),
    }
}
