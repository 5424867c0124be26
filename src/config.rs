//! Configuration parsing and validation for genia-relay.
//!
//! Configuration is assembled once at startup and never mutated afterwards.
//! Provider declaration order is the fallback priority order.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub providers: Vec<ProviderConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:3000")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on chat and evaluation relays in flight, streamed bodies included
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_concurrent_requests() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

/// Relay behaviour: deadlines, degraded-mode pacing, fallback notices.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Deadline for a provider to answer with response headers
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest allowed gap between two body chunks of a provider stream
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Delay between word chunks of a synthetic (degraded-mode) stream
    #[serde(default = "default_degraded_chunk_delay_ms")]
    pub degraded_chunk_delay_ms: u64,
    /// Whether a substituted provider's output is prefixed with a notice
    #[serde(default = "default_true")]
    pub fallback_notice: bool,
    /// Bounded wait for each provider health probe
    #[serde(default = "default_health_probe_timeout_secs")]
    pub health_probe_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_degraded_chunk_delay_ms() -> u64 {
    50
}

fn default_health_probe_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            degraded_chunk_delay_ms: default_degraded_chunk_delay_ms(),
            fallback_notice: true,
            health_probe_timeout_secs: default_health_probe_timeout_secs(),
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn degraded_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.degraded_chunk_delay_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The raw value is only reachable through [`ApiKey::expose_secret`].
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Streaming wire format spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `choices[0].delta.content` chunks with bearer auth
    OpenAi,
    /// OpenAI-shaped chunks plus Mistral's `safe_prompt` and session header
    Mistral,
    /// Separate `system` field, `delta.text` chunks, `x-api-key` auth
    Anthropic,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::OpenAi => "openai",
            WireFormat::Mistral => "mistral",
            WireFormat::Anthropic => "anthropic",
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Wire format of the endpoint
    pub format: WireFormat,
    /// Full chat endpoint URL (e.g., "https://api.openai.com/v1/chat/completions")
    pub url: String,
    /// Model identifier sent upstream
    pub model: String,
    /// Credential; a provider without one is never invoked
    pub api_key: Option<ApiKey>,
}

impl ProviderConfig {
    /// Whether a credential is present.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProviderConfig {
    name: String,
    #[serde(default = "default_format")]
    format: WireFormat,
    url: String,
    model: String,
    api_key: Option<String>,
}

fn default_format() -> WireFormat {
    WireFormat::OpenAi
}

/// Raw configuration deserialized directly from TOML.
///
/// A missing `[[providers]]` table selects the built-in provider chain.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    relay: RelayConfig,
    providers: Option<Vec<RawProviderConfig>>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Built-in provider chain: fastest and cheapest first.
pub fn default_providers() -> Vec<RawProviderConfig> {
    vec![
        RawProviderConfig {
            name: "mistral".to_string(),
            format: WireFormat::Mistral,
            url: "https://api.mistral.ai/v1/chat/completions".to_string(),
            model: "mistral-small-latest".to_string(),
            api_key: None,
        },
        RawProviderConfig {
            name: "openai".to_string(),
            format: WireFormat::OpenAi,
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-5-mini".to_string(),
            api_key: None,
        },
        RawProviderConfig {
            name: "anthropic".to_string(),
            format: WireFormat::Anthropic,
            url: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key: None,
        },
    ]
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string. Fails on first missing variable,
/// unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a provider.
///
/// - "mistral" -> "MISTRAL_API_KEY"
/// - "open-ai" -> "OPEN_AI_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("{}_API_KEY", upper_snake)
}

impl Config {
    /// Convert raw config to final config, resolving credentials through `lookup`.
    ///
    /// For each provider:
    /// - `api_key` containing `${VAR}`: expanded, source = `EnvExpanded`
    /// - literal `api_key`: wrapped directly, source = `Literal`
    /// - absent `api_key`: convention variable, source = `Convention(var)` or `None`
    ///
    /// Blank values count as absent: an empty `OPENAI_API_KEY=` leaves the
    /// provider unconfigured rather than sending an empty credential.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_providers = raw.providers.unwrap_or_else(default_providers);
        let mut providers = Vec::with_capacity(raw_providers.len());
        let mut key_sources = Vec::with_capacity(raw_providers.len());

        for rp in raw_providers {
            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars_with(raw_key, &rp.name, &lookup)?;
                    (Some(expanded), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(raw_key.clone()), KeySource::Literal),
                None => {
                    let var_name = convention_env_var_name(&rp.name);
                    match lookup(&var_name) {
                        Some(value) => (Some(value), KeySource::Convention(var_name)),
                        None => (None, KeySource::None),
                    }
                }
            };

            let (api_key, source) = match api_key {
                Some(key) if !key.trim().is_empty() => (Some(ApiKey::from(key)), source),
                _ => (None, KeySource::None),
            };

            key_sources.push((rp.name.clone(), source));

            providers.push(ProviderConfig {
                name: rp.name,
                format: rp.format,
                url: rp.url,
                model: rp.model,
                api_key,
            });
        }

        let config = Config {
            server: raw.server,
            relay: raw.relay,
            providers,
            logging: raw.logging,
        };
        config.validate()?;

        Ok((config, key_sources))
    }

    /// Convert raw config using real environment variables.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Parse a TOML document and resolve credentials from the environment.
    pub fn parse_str_with_env(
        content: &str,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        Self::from_raw(raw)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with_env(&content)
    }

    /// Built-in defaults with credentials taken from convention env vars.
    pub fn from_env() -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw(RawConfig::default())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if provider.model.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty model",
                    provider.name
                )));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' is declared more than once",
                    provider.name
                )));
            }
        }

        if self.relay.request_timeout_secs == 0 || self.relay.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relay timeouts must be greater than zero".to_string(),
            ));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_requests must be greater than zero".to_string(),
            ));
        }
        if self.server.max_concurrent_requests > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::Validation(format!(
                "max_concurrent_requests must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.relay.health_probe_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "health_probe_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Providers that carry a credential, in priority order.
    pub fn configured_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.is_configured())
    }
}
