use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PROVIDER: &str = "openai";

/// Connection settings for an OpenAI-compatible chat completions endpoint.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub provider: String,
    /// Validated endpoint root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            model: DEFAULT_MODEL.into(),
        }
    }
}

/// Runtime knobs of the session and generation services.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub batch_size: u32,
    /// Exam countdown granted per question (96 questions → 2 hours).
    pub exam_secs_per_question: u64,
    pub generation_timeout: Duration,
    pub daily_batch_cap: u32,
    pub cooldown_secs: u32,
    pub provider: ProviderConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            exam_secs_per_question: 75,
            generation_timeout: Duration::from_secs(90),
            daily_batch_cap: 200,
            cooldown_secs: 0,
            provider: ProviderConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read the configuration from `QUDRAT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ServiceConfig::from_env`] with an injectable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a value is set but malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let base_url = match get("QUDRAT_AI_BASE_URL") {
            Some(raw) => Url::parse(raw.trim())
                .map_err(|source| ConfigError::InvalidBaseUrl {
                    raw: raw.clone(),
                    source,
                })?
                .as_str()
                .trim_end_matches('/')
                .to_string(),
            None => defaults.provider.base_url,
        };

        Ok(Self {
            batch_size: parse_positive(get("QUDRAT_BATCH_SIZE"), "QUDRAT_BATCH_SIZE")?
                .unwrap_or(defaults.batch_size),
            exam_secs_per_question: parse_positive(
                get("QUDRAT_EXAM_SECS_PER_QUESTION"),
                "QUDRAT_EXAM_SECS_PER_QUESTION",
            )?
            .unwrap_or(defaults.exam_secs_per_question),
            generation_timeout: parse_positive::<u64>(
                get("QUDRAT_GENERATION_TIMEOUT_SECS"),
                "QUDRAT_GENERATION_TIMEOUT_SECS",
            )?
            .map_or(defaults.generation_timeout, Duration::from_secs),
            daily_batch_cap: parse_positive(get("QUDRAT_DAILY_BATCH_CAP"), "QUDRAT_DAILY_BATCH_CAP")?
                .unwrap_or(defaults.daily_batch_cap),
            cooldown_secs: parse_number(get("QUDRAT_COOLDOWN_SECS"), "QUDRAT_COOLDOWN_SECS")?
                .unwrap_or(defaults.cooldown_secs),
            provider: ProviderConfig {
                provider: get("QUDRAT_AI_PROVIDER").unwrap_or(defaults.provider.provider),
                base_url,
                api_key: get("QUDRAT_AI_API_KEY"),
                model: get("QUDRAT_AI_MODEL").unwrap_or(defaults.provider.model),
            },
        })
    }

    /// Countdown granted to an exam of `total_questions`.
    #[must_use]
    pub fn exam_duration_secs(&self, total_questions: u32) -> u64 {
        u64::from(total_questions).saturating_mul(self.exam_secs_per_question)
    }
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    raw.map(|raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { var, raw })
    })
    .transpose()
}

fn parse_positive<T: std::str::FromStr + Default + PartialEq>(
    raw: Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let value = parse_number::<T>(raw.clone(), var)?;
    if value.as_ref() == Some(&T::default()) {
        return Err(ConfigError::InvalidNumber {
            var,
            raw: raw.unwrap_or_default(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.exam_duration_secs(96), 7_200);
        assert_eq!(config.generation_timeout, Duration::from_secs(90));
        assert_eq!(config.provider.model, DEFAULT_MODEL);
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("QUDRAT_BATCH_SIZE", "5"),
            ("QUDRAT_COOLDOWN_SECS", "0"),
            ("QUDRAT_AI_BASE_URL", "http://localhost:8080/v1"),
            ("QUDRAT_AI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.cooldown_secs, 0);
        assert_eq!(config.provider.base_url, "http://localhost:8080/v1");
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[("QUDRAT_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { var: "QUDRAT_BATCH_SIZE", .. }));

        let err =
            ServiceConfig::from_lookup(lookup(&[("QUDRAT_AI_BASE_URL", "not a url")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl { .. }));
    }
}
