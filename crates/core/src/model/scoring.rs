use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::answer::Answer;
use crate::model::question::{Question, Section};

/// Categories at or above this accuracy (percent) count as strengths.
pub const STRENGTH_THRESHOLD_PERCENT: u32 = 70;

/// At most this many strengths and weaknesses are reported.
pub const MAX_RANKED_CATEGORIES: usize = 3;

/// Accuracy for one question topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScore {
    pub topic: String,
    pub correct: u32,
    pub total: u32,
}

impl CategoryScore {
    /// Accuracy as a whole percentage (0 when nothing was answered).
    #[must_use]
    pub fn percent(&self) -> u32 {
        percent(self.correct, self.total)
    }

    fn is_strength(&self) -> bool {
        u64::from(self.correct) * 100 >= u64::from(self.total) * u64::from(STRENGTH_THRESHOLD_PERCENT)
    }

    /// Compares accuracy exactly, without rounding.
    fn cmp_accuracy(&self, other: &Self) -> std::cmp::Ordering {
        (u64::from(self.correct) * u64::from(other.total))
            .cmp(&(u64::from(other.correct) * u64::from(self.total)))
    }
}

/// Final results of a completed session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionScores {
    pub verbal_score: u32,
    pub quantitative_score: u32,
    pub overall_score: u32,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub categories: Vec<CategoryScore>,
}

#[derive(Default)]
struct Tally {
    correct: u32,
    total: u32,
}

impl Tally {
    fn add(&mut self, correct: bool) {
        self.total = self.total.saturating_add(1);
        if correct {
            self.correct = self.correct.saturating_add(1);
        }
    }
}

/// Compute section scores and the category breakdown from recorded answers.
///
/// Answers pointing at an index outside `questions` are ignored.
#[must_use]
pub fn compute_scores(questions: &[Question], answers: &[Answer]) -> SessionScores {
    let mut verbal = Tally::default();
    let mut quantitative = Tally::default();
    let mut overall = Tally::default();
    let mut by_topic: BTreeMap<&str, Tally> = BTreeMap::new();

    for answer in answers {
        let Some(question) = usize::try_from(answer.question_index())
            .ok()
            .and_then(|idx| questions.get(idx))
        else {
            continue;
        };
        let correct = answer.is_correct();
        match question.section() {
            Section::Verbal => verbal.add(correct),
            Section::Quantitative => quantitative.add(correct),
        }
        overall.add(correct);
        by_topic.entry(question.topic()).or_default().add(correct);
    }

    let categories: Vec<CategoryScore> = by_topic
        .into_iter()
        .map(|(topic, tally)| CategoryScore {
            topic: topic.to_string(),
            correct: tally.correct,
            total: tally.total,
        })
        .collect();

    let mut strengths: Vec<&CategoryScore> =
        categories.iter().filter(|c| c.is_strength()).collect();
    strengths.sort_by(|a, b| b.cmp_accuracy(a).then_with(|| a.topic.cmp(&b.topic)));

    let mut weaknesses: Vec<&CategoryScore> =
        categories.iter().filter(|c| !c.is_strength()).collect();
    weaknesses.sort_by(|a, b| a.cmp_accuracy(b).then_with(|| a.topic.cmp(&b.topic)));

    SessionScores {
        verbal_score: percent(verbal.correct, verbal.total),
        quantitative_score: percent(quantitative.correct, quantitative.total),
        overall_score: percent(overall.correct, overall.total),
        strengths: top_topics(&strengths),
        weaknesses: top_topics(&weaknesses),
        categories,
    }
}

fn top_topics(ranked: &[&CategoryScore]) -> Vec<String> {
    ranked
        .iter()
        .take(MAX_RANKED_CATEGORIES)
        .map(|c| c.topic.clone())
        .collect()
}

/// Rounded percentage; zero when `total` is zero.
fn percent(correct: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let scaled = (u64::from(correct) * 200 + u64::from(total)) / (u64::from(total) * 2);
    u32::try_from(scaled).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ids::SessionId;
    use crate::model::question::QuestionDraft;
    use crate::time::fixed_now;

    fn q(section: Section, topic: &str) -> Question {
        QuestionDraft {
            section: Some(section),
            topic: Some(topic.into()),
            stem: "s".into(),
            choices: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            answer_index: 0,
            ..QuestionDraft::default()
        }
        .validate()
        .unwrap()
    }

    fn answer(questions: &[Question], idx: u32, correct: bool) -> Answer {
        let selected = if correct { 0 } else { 1 };
        Answer::grade(
            SessionId::new(1),
            idx,
            &questions[idx as usize],
            selected,
            10,
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn zero_answers_score_zero() {
        let scores = compute_scores(&[q(Section::Verbal, "analogy")], &[]);
        assert_eq!(scores, SessionScores::default());
    }

    #[test]
    fn section_scores_use_matching_answers_only() {
        let qs = vec![
            q(Section::Verbal, "analogy"),
            q(Section::Verbal, "analogy"),
            q(Section::Quantitative, "algebra"),
            q(Section::Quantitative, "geometry"),
            q(Section::Quantitative, "geometry"),
        ];
        let answers = vec![
            answer(&qs, 0, true),
            answer(&qs, 1, false),
            answer(&qs, 2, true),
            answer(&qs, 3, true),
            answer(&qs, 4, false),
        ];
        let scores = compute_scores(&qs, &answers);
        assert_eq!(scores.verbal_score, 50);
        assert_eq!(scores.quantitative_score, 67);
        assert_eq!(scores.overall_score, 60);
    }

    #[test]
    fn strengths_and_weaknesses_are_ranked_and_capped() {
        let topics = ["a", "b", "c", "d", "e"];
        let qs: Vec<Question> = topics
            .iter()
            .flat_map(|t| (0..10).map(move |_| q(Section::Verbal, t)))
            .collect();
        // a: 10/10, b: 9/10, c: 8/10, d: 7/10, e: 2/10
        let correct_per_topic = [10, 9, 8, 7, 2];
        let mut answers = Vec::new();
        for (t, correct) in correct_per_topic.iter().enumerate() {
            for i in 0..10 {
                let idx = u32::try_from(t * 10 + i).unwrap();
                answers.push(answer(&qs, idx, i < *correct));
            }
        }

        let scores = compute_scores(&qs, &answers);
        assert_eq!(scores.strengths, vec!["a", "b", "c"]);
        assert_eq!(scores.weaknesses, vec!["e"]);
        assert_eq!(scores.categories.len(), 5);
        assert_eq!(scores.categories[3].percent(), 70);
    }

    #[test]
    fn answers_outside_question_range_are_ignored() {
        let qs = vec![q(Section::Verbal, "analogy")];
        let mut answers = vec![answer(&qs, 0, true)];
        let stray = Answer::from_persisted(SessionId::new(1), 9, 0, true, 1, fixed_now()).unwrap();
        answers.push(stray);
        let scores = compute_scores(&qs, &answers);
        assert_eq!(scores.overall_score, 100);
        assert_eq!(scores.categories.len(), 1);
    }
}
