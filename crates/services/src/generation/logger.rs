use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use qudrat_core::model::{SessionId, UserId};
use storage::repository::{
    GenerationCompletion, GenerationLogRepository, GenerationStatus, NewGenerationLog,
    PriceBookEntry, PriceBookRepository, StorageError,
};

use super::pricing::PriceBook;
use super::provider::TokenUsage;
use crate::error::BudgetError;
use crate::Clock;

/// Per-user limits on batch generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetLimits {
    pub daily_batch_cap: u32,
    pub cooldown_secs: u32,
}

/// Store-backed generation budget: a daily batch cap and a cooldown between
/// batches, counted from the generation log so every instance sees the same
/// usage.
#[derive(Clone)]
pub struct GenerationBudget {
    clock: Clock,
    logs: Arc<dyn GenerationLogRepository>,
    limits: BudgetLimits,
}

impl GenerationBudget {
    #[must_use]
    pub fn new(clock: Clock, logs: Arc<dyn GenerationLogRepository>, limits: BudgetLimits) -> Self {
        Self {
            clock,
            logs,
            limits,
        }
    }

    #[must_use]
    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    /// Check that `user_id` may start another batch now.
    ///
    /// # Errors
    ///
    /// Returns `BudgetError` if a limit is exceeded or persistence fails.
    pub async fn check(&self, user_id: UserId) -> Result<(), BudgetError> {
        let now = self.clock.now();

        let batches_today = self
            .logs
            .count_for_user_since(user_id, start_of_day(now))
            .await?;
        if batches_today >= self.limits.daily_batch_cap {
            return Err(BudgetError::DailyCapReached {
                cap: self.limits.daily_batch_cap,
            });
        }

        if self.limits.cooldown_secs == 0 {
            return Ok(());
        }
        if let Some(last_started_at) = self.logs.last_started_for_user(user_id).await? {
            let cooldown = Duration::seconds(i64::from(self.limits.cooldown_secs));
            if last_started_at + cooldown > now {
                let remaining_secs = (last_started_at + cooldown - now).num_seconds().max(0);
                let remaining = u32::try_from(remaining_secs).unwrap_or(u32::MAX);
                return Err(BudgetError::CooldownActive {
                    remaining_secs: remaining,
                });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct GenerationHandle {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
}

/// Cache effectiveness and spend of one session's batches.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub batches: u32,
    pub cache_hits: u32,
    pub prompt_tokens: u64,
    pub cached_tokens: u64,
    pub cost_micro_usd: u64,
}

impl CacheStats {
    /// Share of batches that hit the prompt cache, in whole percent.
    #[must_use]
    pub fn hit_rate_percent(&self) -> u32 {
        if self.batches == 0 {
            return 0;
        }
        self.cache_hits.saturating_mul(100) / self.batches
    }
}

/// Records one log row per batch and enforces the budget before each one.
#[derive(Clone)]
pub struct GenerationLogger {
    clock: Clock,
    budget: GenerationBudget,
    logs: Arc<dyn GenerationLogRepository>,
    price_book: PriceBook,
}

impl GenerationLogger {
    #[must_use]
    pub fn new(
        clock: Clock,
        logs: Arc<dyn GenerationLogRepository>,
        prices: Arc<dyn PriceBookRepository>,
        limits: BudgetLimits,
    ) -> Self {
        Self {
            clock,
            budget: GenerationBudget::new(clock, Arc::clone(&logs), limits),
            logs,
            price_book: PriceBook::new(prices),
        }
    }

    /// Start a batch after enforcing the user's budget.
    ///
    /// # Errors
    ///
    /// Returns `BudgetError` if limits are exceeded or persistence fails.
    pub async fn start(
        &self,
        session_id: SessionId,
        user_id: UserId,
        batch_index: u32,
        requested: u32,
        provider: &str,
        model: &str,
    ) -> Result<GenerationHandle, BudgetError> {
        self.budget.check(user_id).await?;

        let started_at = self.clock.now();
        let id = self
            .logs
            .insert_started(NewGenerationLog {
                session_id,
                user_id,
                batch_index,
                requested,
                provider: provider.to_string(),
                model: model.to_string(),
                started_at,
            })
            .await?;

        Ok(GenerationHandle {
            id,
            provider: provider.to_string(),
            model: model.to_string(),
            started_at,
        })
    }

    /// Record a successful batch and compute its cost.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if persistence fails.
    pub async fn finish_success(
        &self,
        handle: &GenerationHandle,
        question_count: u32,
        usage: &TokenUsage,
        duration_ms: u64,
    ) -> Result<Option<u64>, StorageError> {
        let cost = self
            .price_book
            .estimate_cost_micro_usd(&handle.provider, &handle.model, usage)
            .await?;
        if cost.is_none() {
            tracing::debug!(
                provider = %handle.provider,
                model = %handle.model,
                "no price entry or usage for model; cost not recorded"
            );
        }

        self.logs
            .update_completion(
                handle.id,
                GenerationCompletion {
                    succeeded: true,
                    duration_ms,
                    question_count,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    cached_tokens: usage.cached_tokens,
                    cache_hit: usage.cache_hit(),
                    cost_micro_usd: cost,
                    error: None,
                },
            )
            .await?;

        Ok(cost)
    }

    /// Record a failed batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if persistence fails.
    pub async fn finish_failure(
        &self,
        handle: &GenerationHandle,
        duration_ms: u64,
        error: &str,
    ) -> Result<(), StorageError> {
        self.logs
            .update_completion(
                handle.id,
                GenerationCompletion {
                    succeeded: false,
                    duration_ms,
                    error: Some(error.to_string()),
                    ..GenerationCompletion::default()
                },
            )
            .await
    }

    /// Aggregate cache hits and cost over the finished batches of a session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on persistence failures.
    pub async fn cache_stats(&self, session_id: SessionId) -> Result<CacheStats, StorageError> {
        let logs = self.logs.list_for_session(session_id).await?;
        let mut stats = CacheStats::default();
        for log in logs
            .iter()
            .filter(|log| log.status == GenerationStatus::Succeeded)
        {
            stats.batches += 1;
            stats.cache_hits += u32::from(log.cache_hit);
            stats.prompt_tokens += u64::from(log.prompt_tokens.unwrap_or(0));
            stats.cached_tokens += u64::from(log.cached_tokens.unwrap_or(0));
            stats.cost_micro_usd = stats
                .cost_micro_usd
                .saturating_add(log.cost_micro_usd.unwrap_or(0));
        }
        Ok(stats)
    }

    /// Total recorded spend since the start of the current day.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on persistence failures.
    pub async fn cost_today(&self) -> Result<u64, StorageError> {
        self.logs
            .sum_cost_since(start_of_day(self.clock.now()))
            .await
    }

    /// List the current price book entries.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on persistence failures.
    pub async fn price_entries(&self) -> Result<Vec<PriceBookEntry>, StorageError> {
        self.price_book.list_entries().await
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qudrat_core::time::fixed_now;
    use storage::repository::InMemoryRepository;

    fn logger(clock: Clock, repo: &InMemoryRepository, limits: BudgetLimits) -> GenerationLogger {
        GenerationLogger::new(clock, Arc::new(repo.clone()), Arc::new(repo.clone()), limits)
    }

    #[tokio::test]
    async fn daily_cap_blocks_further_batches() {
        let repo = InMemoryRepository::new();
        let limits = BudgetLimits {
            daily_batch_cap: 2,
            cooldown_secs: 0,
        };
        let logger = logger(Clock::fixed(fixed_now()), &repo, limits);
        let user = UserId::random();

        for batch in 0..2 {
            logger
                .start(SessionId::new(1), user, batch, 10, "openai", "gpt-4o-mini")
                .await
                .unwrap();
        }
        let err = logger
            .start(SessionId::new(1), user, 2, 10, "openai", "gpt-4o-mini")
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::DailyCapReached { cap: 2 }));

        // other users are unaffected
        logger
            .start(SessionId::new(2), UserId::random(), 0, 10, "openai", "gpt-4o-mini")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cooldown_counts_from_last_batch() {
        let repo = InMemoryRepository::new();
        let limits = BudgetLimits {
            daily_batch_cap: 100,
            cooldown_secs: 30,
        };
        let user = UserId::random();
        let clock = Clock::fixed(fixed_now());
        logger(clock, &repo, limits)
            .start(SessionId::new(1), user, 0, 10, "openai", "m")
            .await
            .unwrap();

        let err = logger(clock.advanced_by_secs(10), &repo, limits)
            .start(SessionId::new(1), user, 1, 10, "openai", "m")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BudgetError::CooldownActive { remaining_secs: 20 }
        ));

        logger(clock.advanced_by_secs(30), &repo, limits)
            .start(SessionId::new(1), user, 1, 10, "openai", "m")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_stats_cover_succeeded_batches() {
        let repo = InMemoryRepository::new();
        let limits = BudgetLimits {
            daily_batch_cap: 100,
            cooldown_secs: 0,
        };
        let logger = logger(Clock::fixed(fixed_now()), &repo, limits);
        let user = UserId::random();
        let session = SessionId::new(7);

        let first = logger
            .start(session, user, 0, 10, "openai", "m")
            .await
            .unwrap();
        logger
            .finish_success(
                &first,
                10,
                &TokenUsage {
                    prompt_tokens: Some(1_200),
                    completion_tokens: Some(900),
                    cached_tokens: None,
                },
                800,
            )
            .await
            .unwrap();

        let second = logger
            .start(session, user, 1, 10, "openai", "m")
            .await
            .unwrap();
        logger
            .finish_success(
                &second,
                10,
                &TokenUsage {
                    prompt_tokens: Some(1_300),
                    completion_tokens: Some(900),
                    cached_tokens: Some(1_024),
                },
                600,
            )
            .await
            .unwrap();

        let failed = logger
            .start(session, user, 2, 10, "openai", "m")
            .await
            .unwrap();
        logger.finish_failure(&failed, 90_000, "timeout").await.unwrap();

        let stats = logger.cache_stats(session).await.unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.hit_rate_percent(), 50);
        assert_eq!(stats.cached_tokens, 1_024);
        assert_eq!(stats.cost_micro_usd, 0);
    }
}
