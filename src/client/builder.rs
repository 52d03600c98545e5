use super::core::GovernedClient;
use super::generator::TextGenerator;
use super::policy::RetryPolicy;
use crate::cache::CacheBackend;
use crate::config::GovernorConfig;
use crate::resilience::RequestGovernor;
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;

/// Builder for [`GovernedClient`].
///
/// Either share an existing governor (several clients drawing on one quota)
/// or let the builder construct one from a [`GovernorConfig`].
pub struct GovernedClientBuilder {
    config: GovernorConfig,
    governor: Option<Arc<RequestGovernor>>,
    generator: Option<Arc<dyn TextGenerator>>,
    cache_backend: Option<Box<dyn CacheBackend>>,
    max_retries: Option<u32>,
}

impl GovernedClientBuilder {
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            governor: None,
            generator: None,
            cache_backend: None,
            max_retries: None,
        }
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply `QUOTA_GOVERNOR_*` environment overrides to the current config.
    pub fn from_env(mut self) -> Self {
        self.config = self.config.with_env_overrides();
        self
    }

    /// Share an existing governor; `config` is then only used for `max_retries`.
    pub fn governor(mut self, governor: Arc<RequestGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn cache_backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn build(self) -> Result<GovernedClient> {
        let generator = self.generator.ok_or_else(|| {
            Error::configuration_with_context(
                "A text generator is required",
                ErrorContext::new()
                    .with_field_path("generator")
                    .with_source("client_builder"),
            )
        })?;

        let governor = match (self.governor, self.cache_backend) {
            (Some(governor), _) => governor,
            (None, Some(backend)) => {
                Arc::new(RequestGovernor::with_cache_backend(&self.config, backend)?)
            }
            (None, None) => Arc::new(RequestGovernor::new(&self.config)?),
        };

        let policy = RetryPolicy::new(self.max_retries.unwrap_or(self.config.max_retries));
        Ok(GovernedClient {
            governor,
            generator,
            policy,
        })
    }
}

impl Default for GovernedClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
