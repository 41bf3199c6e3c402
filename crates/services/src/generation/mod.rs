//! Batch question generation: prompt, provider call, parsing, budget and log.

pub mod generator;
pub mod logger;
pub mod parse;
pub mod pricing;
pub mod prompt;
pub mod provider;

pub use generator::{BatchGenerator, BatchMeta, BatchOutput, BatchParams};
pub use logger::{BudgetLimits, CacheStats, GenerationBudget, GenerationLogger};
pub use pricing::PriceBook;
pub use provider::{
    DisabledProvider, OpenAiCompatibleProvider, ProviderRequest, ProviderResponse,
    QuestionProvider, TokenUsage,
};
