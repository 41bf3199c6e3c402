use std::sync::Arc;

use storage::repository::Storage;

use crate::Clock;
use crate::config::ServiceConfig;
use crate::error::{AppServicesError, ConfigError};
use crate::generation::{
    BatchGenerator, BudgetLimits, DisabledProvider, GenerationLogger, OpenAiCompatibleProvider,
    QuestionProvider,
};
use crate::sessions::SessionService;

/// Assembles app-facing services over one storage backend.
#[derive(Clone)]
pub struct AppServices {
    sessions: Arc<SessionService>,
    generation_enabled: bool,
}

impl AppServices {
    /// Build services backed by `SQLite` storage and the configured provider.
    ///
    /// Without an API key the services still open; every generation request
    /// then fails with `GenerationError::Disabled`.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails or the
    /// provider configuration is invalid.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: ServiceConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        let (provider, generation_enabled): (Arc<dyn QuestionProvider>, bool) =
            match OpenAiCompatibleProvider::new(config.provider.clone()) {
                Ok(provider) => (Arc::new(provider), true),
                Err(ConfigError::MissingApiKey) => {
                    tracing::warn!("QUDRAT_AI_API_KEY is not set; question generation is disabled");
                    (Arc::new(DisabledProvider), false)
                }
                Err(e) => return Err(e.into()),
            };

        let mut services = Self::new(storage, provider, clock, config);
        services.generation_enabled = generation_enabled;
        Ok(services)
    }

    /// Build services over any storage and provider.
    #[must_use]
    pub fn new(
        storage: Storage,
        provider: Arc<dyn QuestionProvider>,
        clock: Clock,
        config: ServiceConfig,
    ) -> Self {
        let logger = GenerationLogger::new(
            clock,
            Arc::clone(&storage.generation_logs),
            Arc::clone(&storage.price_book),
            BudgetLimits {
                daily_batch_cap: config.daily_batch_cap,
                cooldown_secs: config.cooldown_secs,
            },
        );
        let generator = BatchGenerator::new(provider, logger, config.generation_timeout);
        let sessions = Arc::new(SessionService::new(
            clock,
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.answers),
            generator,
            config,
        ));

        Self {
            sessions,
            generation_enabled: true,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Arc<SessionService> {
        Arc::clone(&self.sessions)
    }

    #[must_use]
    pub fn generation_enabled(&self) -> bool {
        self.generation_enabled
    }
}
