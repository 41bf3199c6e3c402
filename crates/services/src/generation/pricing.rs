use std::sync::Arc;

use storage::repository::{PriceBookEntry, PriceBookRepository, StorageError};

use super::provider::TokenUsage;

#[derive(Clone)]
pub struct PriceBook {
    repo: Arc<dyn PriceBookRepository>,
}

impl PriceBook {
    #[must_use]
    pub fn new(repo: Arc<dyn PriceBookRepository>) -> Self {
        Self { repo }
    }

    /// List all pricing entries.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on persistence failures.
    pub async fn list_entries(&self) -> Result<Vec<PriceBookEntry>, StorageError> {
        self.repo.list_entries().await
    }

    /// Estimate the cost in micro-USD for the given token usage.
    ///
    /// Returns `None` when the model has no price entry or the provider did
    /// not report usage.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on persistence failures.
    pub async fn estimate_cost_micro_usd(
        &self,
        provider: &str,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<Option<u64>, StorageError> {
        let (Some(prompt_tokens), Some(completion_tokens)) =
            (usage.prompt_tokens, usage.completion_tokens)
        else {
            return Ok(None);
        };
        let Some(entry) = self.repo.get_entry(provider, model).await? else {
            return Ok(None);
        };

        Ok(Some(estimate_cost_micro_usd(
            &entry,
            prompt_tokens,
            usage.cached_tokens.unwrap_or(0),
            completion_tokens,
        )))
    }
}

/// Cached prompt tokens are billed at the cached rate, the rest at the input rate.
fn estimate_cost_micro_usd(
    entry: &PriceBookEntry,
    prompt_tokens: u32,
    cached_tokens: u32,
    completion_tokens: u32,
) -> u64 {
    let cached = cached_tokens.min(prompt_tokens);
    let uncached = prompt_tokens - cached;
    let prompt_cost = u64::from(uncached).saturating_mul(entry.input_micro_usd_per_million)
        / 1_000_000;
    let cached_cost = u64::from(cached)
        .saturating_mul(entry.cached_input_micro_usd_per_million)
        / 1_000_000;
    let completion_cost = u64::from(completion_tokens)
        .saturating_mul(entry.output_micro_usd_per_million)
        / 1_000_000;
    prompt_cost
        .saturating_add(cached_cost)
        .saturating_add(completion_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::repository::InMemoryRepository;

    fn entry() -> PriceBookEntry {
        PriceBookEntry {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            input_micro_usd_per_million: 150_000,
            cached_input_micro_usd_per_million: 75_000,
            output_micro_usd_per_million: 600_000,
            deprecated: false,
        }
    }

    #[test]
    fn cached_tokens_use_the_discounted_rate() {
        let full = estimate_cost_micro_usd(&entry(), 2_000_000, 0, 0);
        let cached = estimate_cost_micro_usd(&entry(), 2_000_000, 1_000_000, 0);
        assert_eq!(full, 300_000);
        assert_eq!(cached, 225_000);
    }

    #[test]
    fn cached_count_is_capped_by_prompt_tokens() {
        assert_eq!(
            estimate_cost_micro_usd(&entry(), 1_000_000, 5_000_000, 1_000_000),
            75_000 + 600_000
        );
    }

    #[tokio::test]
    async fn unknown_model_has_no_cost() {
        let repo = InMemoryRepository::new();
        let book = PriceBook::new(Arc::new(repo.clone()));
        let usage = TokenUsage {
            prompt_tokens: Some(1_000),
            completion_tokens: Some(500),
            cached_tokens: None,
        };
        assert_eq!(
            book.estimate_cost_micro_usd("openai", "gpt-4o-mini", &usage)
                .await
                .unwrap(),
            None
        );

        repo.upsert_entry(&entry()).await.unwrap();
        assert_eq!(
            book.estimate_cost_micro_usd("openai", "gpt-4o-mini", &usage)
                .await
                .unwrap(),
            Some(150 + 300)
        );
    }
}
