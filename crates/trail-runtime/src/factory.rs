//! Provider factory
//!
//! The one place a backend in the closed [`ProviderKind`] set is wired to its
//! adapter.

use std::sync::Arc;
use std::time::Duration;

use trail_core::{AgentError, LlmProvider, ProviderKind, Result};

use crate::anthropic::AnthropicProvider;
use crate::google::GoogleProvider;
use crate::openai::OpenAiProvider;

const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Connection settings for one backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Secret for hosted backends
    pub api_key: Option<String>,

    /// Overrides the backend's public endpoint
    pub base_url: Option<String>,

    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ProviderSettings {
    /// Read `<PROVIDER>_API_KEY` and `<PROVIDER>_BASE_URL`
    ///
    /// Ollama also honours `OLLAMA_HOST`/`OLLAMA_PORT` when no base url is set.
    pub fn from_env(kind: ProviderKind) -> Self {
        Self::from_lookup(kind, |name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source
    pub fn from_lookup(kind: ProviderKind, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let prefix = kind.as_str().to_ascii_uppercase();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut base_url = non_empty(&format!("{prefix}_BASE_URL"));
        if base_url.is_none() && kind == ProviderKind::Ollama {
            let host = non_empty("OLLAMA_HOST");
            let port = non_empty("OLLAMA_PORT");
            if host.is_some() || port.is_some() {
                base_url = Some(format!(
                    "{}:{}",
                    host.as_deref().unwrap_or("http://localhost").trim_end_matches('/'),
                    port.as_deref().unwrap_or("11434")
                ));
            }
        }

        Self {
            api_key: non_empty(&format!("{prefix}_API_KEY")),
            base_url,
            timeout_secs: non_empty(&format!("{prefix}_TIMEOUT_SECS"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn require_key(&self, kind: ProviderKind) -> Result<String> {
        self.api_key.clone().ok_or_else(|| {
            AgentError::Config(format!(
                "{}_API_KEY is not set for provider '{kind}'",
                kind.as_str().to_ascii_uppercase()
            ))
        })
    }
}

/// Build the adapter for `kind`
pub fn build_provider(kind: ProviderKind, settings: ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    tracing::debug!(provider = %kind, base_url = ?settings.base_url, "building provider");

    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::OpenAi | ProviderKind::OpenRouter | ProviderKind::Doubao => {
            let api_key = settings.require_key(kind)?;
            Arc::new(OpenAiProvider::new(kind, api_key, settings.base_url.clone(), settings.timeout())?)
        }
        ProviderKind::Anthropic => {
            let api_key = settings.require_key(kind)?;
            Arc::new(AnthropicProvider::new(api_key, settings.base_url.clone(), settings.timeout())?)
        }
        ProviderKind::Google => {
            let api_key = settings.require_key(kind)?;
            Arc::new(GoogleProvider::new(api_key, settings.base_url.clone(), settings.timeout())?)
        }
        ProviderKind::Ollama => build_ollama(&settings)?,
    };
    Ok(provider)
}

#[cfg(feature = "ollama")]
fn build_ollama(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    use crate::ollama::{OllamaConfig, OllamaProvider};

    let config = match &settings.base_url {
        Some(url) => OllamaConfig::from_url(url)?,
        None => OllamaConfig::default(),
    };
    Ok(Arc::new(OllamaProvider::from_config(config)))
}

#[cfg(not(feature = "ollama"))]
fn build_ollama(_settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    Err(AgentError::Config(
        "trail-runtime was built without the `ollama` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_settings_from_provider_prefixed_vars() {
        let settings = ProviderSettings::from_lookup(
            ProviderKind::OpenRouter,
            lookup(&[
                ("OPENROUTER_API_KEY", "sk-or-123"),
                ("OPENROUTER_BASE_URL", "https://proxy.local/v1"),
                ("OPENAI_API_KEY", "wrong"),
            ]),
        );
        assert_eq!(settings.api_key.as_deref(), Some("sk-or-123"));
        assert_eq!(settings.base_url.as_deref(), Some("https://proxy.local/v1"));
        assert_eq!(settings.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_ollama_host_and_port() {
        let settings = ProviderSettings::from_lookup(
            ProviderKind::Ollama,
            lookup(&[("OLLAMA_HOST", "http://gpu-box/"), ("OLLAMA_PORT", "11500")]),
        );
        assert_eq!(settings.base_url.as_deref(), Some("http://gpu-box:11500"));
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let err = build_provider(ProviderKind::Anthropic, ProviderSettings::default()).err();
        match err {
            Some(AgentError::Config(msg)) => assert!(msg.contains("ANTHROPIC_API_KEY")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_every_hosted_kind_builds_with_a_key() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::OpenRouter,
            ProviderKind::Doubao,
            ProviderKind::Anthropic,
            ProviderKind::Google,
        ] {
            let provider = build_provider(kind, ProviderSettings::default().with_api_key("k")).unwrap();
            assert_eq!(provider.name(), kind.as_str());
        }
    }
}
