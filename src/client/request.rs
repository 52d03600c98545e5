use super::generator::GenerationConfig;
use crate::cache::{Fingerprint, FingerprintBuilder};

/// One logical generation request.
///
/// The subject, secondary identifiers, query and mode flags make up the
/// request's identity; two requests that agree on all of them share a cache
/// entry. The prompt is what is actually sent upstream and defaults to the
/// query.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub subject: String,
    pub secondary: Vec<String>,
    pub query: String,
    pub prompt: Option<String>,
    pub modes: Vec<String>,
    pub config: GenerationConfig,
    /// Separates cache entries for otherwise identical requests.
    pub cache_salt: Option<String>,
    /// Skip the cache lookup (the fresh answer is still stored).
    pub bypass_cache: bool,
}

impl GenerateRequest {
    pub fn new(subject: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_secondary(mut self, id: impl Into<String>) -> Self {
        self.secondary.push(id.into());
        self
    }

    pub fn with_mode(mut self, flag: impl Into<String>) -> Self {
        self.modes.push(flag.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cache_salt(mut self, salt: impl Into<String>) -> Self {
        self.cache_salt = Some(salt.into());
        self
    }

    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.query)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut builder = FingerprintBuilder::new(&self.subject).query(&self.query);
        for id in &self.secondary {
            builder = builder.secondary(id);
        }
        for mode in &self.modes {
            builder = builder.mode(mode);
        }
        if let Some(salt) = &self.cache_salt {
            builder = builder.salt(salt);
        }
        builder.build()
    }
}
