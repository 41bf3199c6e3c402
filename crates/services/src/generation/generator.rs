use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qudrat_core::model::{
    Difficulty, GenerationContext, Question, Section, Session, SessionId, ShapeDefaults, UserId,
};
use rand::seq::SliceRandom;

use super::logger::{GenerationHandle, GenerationLogger};
use super::parse::parse_questions;
use super::prompt::BatchPrompt;
use super::provider::{QuestionProvider, TokenUsage};
use crate::error::GenerationError;

/// Inputs of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchParams {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub batch_index: u32,
    pub batch_size: u32,
    pub section: Section,
    pub categories: Vec<String>,
    pub difficulty: Option<Difficulty>,
}

impl BatchParams {
    /// Parameters of the next batch of `session`.
    ///
    /// Exam batches follow the track's section mix and keep only the chosen
    /// categories that belong to the batch's section. Categories are rotated
    /// by batch index so every batch leads with a different one.
    #[must_use]
    pub fn for_session(session: &Session, difficulty: Option<Difficulty>) -> Self {
        let batch_index = session.next_batch_index();
        let section = session.kind().section_for_batch(batch_index);

        let mut categories = if session.kind().is_exam() {
            let pool = section.default_categories();
            let chosen: Vec<String> = session
                .categories()
                .iter()
                .filter(|category| pool.contains(category))
                .cloned()
                .collect();
            if chosen.is_empty() { pool } else { chosen }
        } else {
            session.categories().to_vec()
        };
        if !categories.is_empty() {
            let shift = usize::try_from(batch_index).unwrap_or(0) % categories.len();
            categories.rotate_left(shift);
        }

        Self {
            session_id: session.id(),
            user_id: session.user_id(),
            batch_index,
            batch_size: session.next_batch_size(),
            section,
            categories,
            difficulty,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    pub provider: String,
    pub model: String,
    pub cache_hit: bool,
    pub cached_tokens: u32,
    pub duration_ms: u64,
    pub cost_micro_usd: Option<u64>,
}

/// A generated batch and the context it produced.
#[derive(Clone, Debug)]
pub struct BatchOutput {
    pub questions: Vec<Question>,
    pub context: GenerationContext,
    pub usage: TokenUsage,
    pub meta: BatchMeta,
}

/// Produces one batch of questions per call.
///
/// Has no side effects besides the provider call and the generation log. It
/// never retries; callers decide what a failed batch means for the session.
#[derive(Clone)]
pub struct BatchGenerator {
    provider: Arc<dyn QuestionProvider>,
    logger: GenerationLogger,
    timeout: Duration,
    balance_choices: bool,
}

impl BatchGenerator {
    #[must_use]
    pub fn new(
        provider: Arc<dyn QuestionProvider>,
        logger: GenerationLogger,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            logger,
            timeout,
            balance_choices: true,
        }
    }

    /// Keep the provider's choice order instead of shuffling it.
    #[must_use]
    pub fn without_choice_shuffle(mut self) -> Self {
        self.balance_choices = false;
        self
    }

    #[must_use]
    pub fn logger(&self) -> &GenerationLogger {
        &self.logger
    }

    /// Generate the batch described by `params` on top of `context`.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError` for invalid parameters, an out-of-order batch,
    /// an exhausted budget, provider failures, timeouts, unparseable output,
    /// or a batch with no usable questions.
    #[tracing::instrument(
        skip_all,
        fields(session_id = %params.session_id, batch_index = params.batch_index)
    )]
    pub async fn generate_batch(
        &self,
        params: &BatchParams,
        context: &GenerationContext,
    ) -> Result<BatchOutput, GenerationError> {
        if params.batch_size == 0 {
            return Err(GenerationError::InvalidParams("batch size must be > 0"));
        }
        if params.categories.is_empty() {
            return Err(GenerationError::InvalidParams("categories must not be empty"));
        }
        context.ensure_next(params.batch_index)?;

        let handle = self
            .logger
            .start(
                params.session_id,
                params.user_id,
                params.batch_index,
                params.batch_size,
                self.provider.provider(),
                self.provider.model(),
            )
            .await?;

        let started = Instant::now();
        let result = self.request_questions(params, context).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (questions, usage) = match result {
            Ok(generated) => generated,
            Err(err) => {
                self.record_failure(&handle, duration_ms, &err).await;
                return Err(err);
            }
        };
        let questions = self.select(questions, params.batch_size, context);
        if questions.is_empty() {
            let err = GenerationError::EmptyBatch;
            self.record_failure(&handle, duration_ms, &err).await;
            return Err(err);
        }

        let context = context.advance(params.batch_index, questions.iter().map(Question::id))?;
        let question_count = u32::try_from(questions.len()).unwrap_or(u32::MAX);
        let cost_micro_usd = match self
            .logger
            .finish_success(&handle, question_count, &usage, duration_ms)
            .await
        {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "failed to record batch completion");
                None
            }
        };

        tracing::info!(
            count = question_count,
            duration_ms,
            cache_hit = usage.cache_hit(),
            cost_micro_usd = ?cost_micro_usd,
            "generated question batch"
        );

        Ok(BatchOutput {
            questions,
            context,
            meta: BatchMeta {
                provider: handle.provider,
                model: handle.model,
                cache_hit: usage.cache_hit(),
                cached_tokens: usage.cached_tokens.unwrap_or(0),
                duration_ms,
                cost_micro_usd,
            },
            usage,
        })
    }

    async fn request_questions(
        &self,
        params: &BatchParams,
        context: &GenerationContext,
    ) -> Result<(Vec<Question>, TokenUsage), GenerationError> {
        let request = BatchPrompt {
            batch_index: params.batch_index,
            count: params.batch_size,
            section: params.section,
            categories: &params.categories,
            difficulty: params.difficulty,
            avoid_ids: context.generated_ids(),
        }
        .to_request();

        let response = tokio::time::timeout(self.timeout, self.provider.complete(&request))
            .await
            .map_err(|_| GenerationError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        let defaults = ShapeDefaults {
            section: Some(params.section),
            topic: params.categories.first().cloned(),
            difficulty: params.difficulty,
        };
        let questions = parse_questions(&response.content, &defaults)?;
        Ok((questions, response.usage))
    }

    /// Drops repeats of earlier batches and of this batch, caps the size and
    /// balances the answer positions.
    fn select(
        &self,
        questions: Vec<Question>,
        batch_size: u32,
        context: &GenerationContext,
    ) -> Vec<Question> {
        let mut seen = HashSet::new();
        let mut kept: Vec<Question> = questions
            .into_iter()
            .filter(|question| {
                !context.contains(question.id()) && seen.insert(question.id().clone())
            })
            .collect();
        kept.truncate(usize::try_from(batch_size).unwrap_or(usize::MAX));

        if self.balance_choices {
            shuffle_choices(kept)
        } else {
            kept
        }
    }

    async fn record_failure(
        &self,
        handle: &GenerationHandle,
        duration_ms: u64,
        err: &GenerationError,
    ) {
        tracing::warn!(
            error = err as &dyn std::error::Error,
            duration_ms,
            "question batch failed"
        );
        if let Err(e) = self
            .logger
            .finish_failure(handle, duration_ms, &err.to_string())
            .await
        {
            tracing::warn!(error = &e as &dyn std::error::Error, "failed to record batch failure");
        }
    }
}

/// Providers favour the first choice for the correct answer; reorder the
/// choices of every question at random.
fn shuffle_choices(questions: Vec<Question>) -> Vec<Question> {
    let mut rng = rand::rng();
    questions
        .into_iter()
        .map(|question| {
            let mut order = [0, 1, 2, 3];
            order.shuffle(&mut rng);
            let fallback = question.clone();
            question.with_choice_order(order).unwrap_or(fallback)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use qudrat_core::model::{NewSession, QuestionId, SessionKind, Track};
    use qudrat_core::time::fixed_now;
    use storage::repository::{GenerationLogRepository, GenerationStatus, InMemoryRepository};

    use super::*;
    use crate::Clock;
    use crate::generation::logger::BudgetLimits;
    use crate::generation::provider::{ProviderRequest, ProviderResponse};

    struct StubProvider {
        content: String,
        delay: Option<Duration>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl StubProvider {
        fn returning(content: impl Into<String>) -> Self {
            Self {
                content: content.into(),
                delay: None,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QuestionProvider for StubProvider {
        fn provider(&self) -> &str {
            "stub"
        }

        fn model(&self) -> &str {
            "stub-1"
        }

        async fn complete(
            &self,
            request: &ProviderRequest,
        ) -> Result<ProviderResponse, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ProviderResponse {
                content: self.content.clone(),
                usage: TokenUsage {
                    prompt_tokens: Some(1_000),
                    completion_tokens: Some(400),
                    cached_tokens: Some(512),
                },
            })
        }
    }

    fn item(id: &str) -> String {
        format!(
            r#"{{"id": "{id}", "topic": "algebra", "stem": "stem {id}", "choices": ["right", "w1", "w2", "w3"], "answerIndex": 0}}"#
        )
    }

    fn payload(ids: &[&str]) -> String {
        let items: Vec<String> = ids.iter().map(|id| item(id)).collect();
        format!(r#"{{"questions": [{}]}}"#, items.join(","))
    }

    fn generator(provider: StubProvider, repo: &InMemoryRepository, cap: u32) -> BatchGenerator {
        let logger = GenerationLogger::new(
            Clock::fixed(fixed_now()),
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            BudgetLimits {
                daily_batch_cap: cap,
                cooldown_secs: 0,
            },
        );
        BatchGenerator::new(Arc::new(provider), logger, Duration::from_millis(200))
    }

    fn params(batch_index: u32, batch_size: u32) -> BatchParams {
        BatchParams {
            session_id: SessionId::new(1),
            user_id: UserId::random(),
            batch_index,
            batch_size,
            section: Section::Quantitative,
            categories: vec!["algebra".into()],
            difficulty: None,
        }
    }

    #[tokio::test]
    async fn drops_repeats_and_truncates_to_batch_size() {
        let repo = InMemoryRepository::new();
        let generator = generator(
            StubProvider::returning(payload(&["old", "a", "a", "b", "c"])),
            &repo,
            10,
        );
        let context = GenerationContext::empty()
            .advance(0, [&QuestionId::new("old")])
            .unwrap();

        let output = generator.generate_batch(&params(1, 2), &context).await.unwrap();

        let ids: Vec<&str> = output.questions.iter().map(|q| q.id().as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(output.context.last_batch_index(), 1);
        assert!(output.context.contains(&QuestionId::new("old")));
        assert!(output.context.contains(&QuestionId::new("b")));
        assert!(!output.context.contains(&QuestionId::new("c")));
        assert!(output.meta.cache_hit);
        assert_eq!(output.meta.cached_tokens, 512);
    }

    #[tokio::test]
    async fn shuffled_choices_keep_the_correct_answer() {
        let repo = InMemoryRepository::new();
        let ids: Vec<String> = (0..8).map(|i| format!("q{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let generator = generator(StubProvider::returning(payload(&id_refs)), &repo, 10);

        let output = generator
            .generate_batch(&params(0, 8), &GenerationContext::empty())
            .await
            .unwrap();

        for question in &output.questions {
            assert_eq!(question.choices()[usize::from(question.answer_index())], "right");
        }
    }

    #[tokio::test]
    async fn out_of_order_batch_is_rejected_before_the_provider_call() {
        let repo = InMemoryRepository::new();
        let provider = Arc::new(StubProvider::returning(payload(&["a"])));
        let logger = GenerationLogger::new(
            Clock::fixed(fixed_now()),
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            BudgetLimits {
                daily_batch_cap: 10,
                cooldown_secs: 0,
            },
        );
        let generator = BatchGenerator::new(provider.clone(), logger, Duration::from_secs(1));

        let err = generator
            .generate_batch(&params(2, 5), &GenerationContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::BatchOrder(_)));

        let err = generator
            .generate_batch(&params(0, 0), &GenerationContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidParams(_)));
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_logged_as_failure() {
        let repo = InMemoryRepository::new();
        let generator = generator(StubProvider::returning(r#"{"questions": []}"#), &repo, 10);

        let err = generator
            .generate_batch(&params(0, 5), &GenerationContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::EmptyBatch));

        let logs = repo.list_for_session(SessionId::new(1)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, GenerationStatus::Failed);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let repo = InMemoryRepository::new();
        let mut provider = StubProvider::returning(payload(&["a"]));
        provider.delay = Some(Duration::from_secs(5));
        let generator = generator(provider, &repo, 10);

        let err = generator
            .generate_batch(&params(0, 5), &GenerationContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout { .. }));
    }

    #[tokio::test]
    async fn exhausted_budget_skips_the_provider() {
        let repo = InMemoryRepository::new();
        let generator = generator(StubProvider::returning(payload(&["a"])), &repo, 0);

        let err = generator
            .generate_batch(&params(0, 5), &GenerationContext::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Budget(_)));
    }

    #[test]
    fn exam_params_follow_the_track_and_rotate_categories() {
        let session = NewSession::new(
            UserId::random(),
            SessionKind::Exam {
                track: Track::Scientific,
            },
            96,
            10,
            vec!["geometry".into(), "analogy".into(), "algebra".into()],
            fixed_now(),
            7_200,
        )
        .unwrap()
        .into_session(SessionId::new(4));

        let params = BatchParams::for_session(&session, None);
        assert_eq!(params.batch_index, 0);
        assert_eq!(params.batch_size, 10);
        assert_eq!(params.section, Track::Scientific.section_for_batch(0));
        match params.section {
            Section::Quantitative => assert_eq!(params.categories, ["geometry", "algebra"]),
            Section::Verbal => assert_eq!(params.categories, ["analogy"]),
        }
    }

    #[test]
    fn practice_categories_rotate_with_the_batch_index() {
        let mut session = NewSession::new(
            UserId::random(),
            SessionKind::Practice {
                section: Section::Verbal,
            },
            20,
            10,
            vec!["analogy".into(), "odd_word".into()],
            fixed_now(),
            0,
        )
        .unwrap()
        .into_session(SessionId::new(5));
        let defaults = ShapeDefaults {
            section: Some(Section::Verbal),
            ..ShapeDefaults::default()
        };
        let question = parse_questions(&payload(&["x"]), &defaults).unwrap().remove(0);
        let context = GenerationContext::empty().advance(0, [question.id()]).unwrap();
        session.append_batch(0, vec![question], context).unwrap();

        let params = BatchParams::for_session(&session, Some(Difficulty::Easy));
        assert_eq!(params.batch_index, 1);
        assert_eq!(params.categories, ["odd_word", "analogy"]);
        assert_eq!(params.difficulty, Some(Difficulty::Easy));
    }
}
