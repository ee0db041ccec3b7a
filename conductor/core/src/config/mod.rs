//! TOML Configuration File Support
//!
//! This module provides centralized configuration loading for the conductor,
//! supporting a TOML configuration file at `~/.config/kunlab/conductor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/kunlab/conductor.toml` (typically `~/.config/kunlab/conductor.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1:8000"
//!
//! [backend]
//! base_url = "http://localhost:11434"
//! connect_timeout_ms = 5000
//! read_timeout_secs = 1800
//! pool_size = 4
//! default_model = "llama2"
//! eviction = "first_slot"
//!
//! [history]
//! max_turns = 20
//! max_document_chars = 200000
//!
//! [search]
//! api_key = "tvly-..."
//! base_url = "https://api.tavily.com"
//! max_results = 5
//! search_depth = "basic"
//! timeout_secs = 30
//!
//! [auth.tokens]
//! "dev-token" = "alice"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::EvictionPolicy;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl ConfigSource {
    fn priority(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::File => 1,
            Self::Env => 2,
            Self::Cli => 3,
        }
    }
}

/// Where each overridable value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigSources {
    /// `server.bind_address`
    pub bind_address: ConfigSource,
    /// `backend.base_url`
    pub backend_url: ConfigSource,
    /// `backend.pool_size`
    pub pool_size: ConfigSource,
    /// `backend.default_model`
    pub default_model: ConfigSource,
    /// `history.max_turns`
    pub max_turns: ConfigSource,
    /// `search.api_key` or `TAVILY_API_KEY`
    pub search_api_key: ConfigSource,
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            bind_address: ConfigSource::Default,
            backend_url: ConfigSource::Default,
            pool_size: ConfigSource::Default,
            default_model: ConfigSource::Default,
            max_turns: ConfigSource::Default,
            search_api_key: ConfigSource::Default,
        }
    }
}

impl ConfigSources {
    fn all(&self) -> [ConfigSource; 6] {
        [
            self.bind_address,
            self.backend_url,
            self.pool_size,
            self.default_model,
            self.max_turns,
            self.search_api_key,
        ]
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address, `host:port`
    pub bind_address: Option<String>,
}

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama base URL
    pub base_url: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Maximum gap between reads in seconds
    pub read_timeout_secs: Option<u64>,
    /// Number of pooled connections (0 = CPU count)
    pub pool_size: Option<usize>,
    /// Model used when neither request nor conversation names one
    pub default_model: Option<String>,
    /// Eviction policy name
    pub eviction: Option<EvictionPolicy>,
}

/// History section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Prior non-system turns kept in a prompt
    pub max_turns: Option<usize>,
    /// Longest document text kept, in characters
    pub max_document_chars: Option<usize>,
}

/// Search section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchToml {
    /// Process-wide search API key
    pub api_key: Option<String>,
    /// Search API base URL
    pub base_url: Option<String>,
    /// Results per search
    pub max_results: Option<usize>,
    /// Default search depth
    pub search_depth: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Auth section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthToml {
    /// Token to user id
    pub tokens: HashMap<String, String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Server configuration section
    pub server: ServerToml,
    /// Backend configuration section
    pub backend: BackendToml,
    /// History configuration section
    pub history: HistoryToml,
    /// Search configuration section
    pub search: SearchToml,
    /// Auth configuration section
    pub auth: AuthToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Backend connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Ollama base URL
    pub base_url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Maximum gap between reads
    pub read_timeout: Duration,
    /// Configured pool size (0 = CPU count)
    pub pool_size: usize,
    /// Fallback model
    pub default_model: String,
    /// Victim selection strategy
    pub eviction: EvictionPolicy,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_secs(1800),
            pool_size: 4,
            default_model: "llama2".to_string(),
            eviction: EvictionPolicy::FirstSlot,
        }
    }
}

impl BackendSettings {
    /// Pool size with 0 resolved to the number of CPUs
    #[must_use]
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size > 0 {
            return self.pool_size;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

/// History shaping settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistorySettings {
    /// Prior non-system turns kept in a prompt
    pub max_turns: usize,
    /// Longest document text kept, in characters
    pub max_document_chars: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_document_chars: 200_000,
        }
    }
}

/// Web search settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchConfig {
    /// Process-wide key from the config file
    pub api_key: Option<String>,
    /// Key from `TAVILY_API_KEY`, tried last
    pub env_api_key: Option<String>,
    /// Search API base URL
    pub base_url: String,
    /// Results per search
    pub max_results: usize,
    /// Default search depth
    pub search_depth: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            env_api_key: None,
            base_url: "https://api.tavily.com".to_string(),
            max_results: 5,
            search_depth: "basic".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Centralized configuration for the conductor
///
/// Consolidates all configuration sources and tracks where values came
/// from. Use [`load_config`] to load configuration with proper priority
/// handling.
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// HTTP listen address, `host:port`
    pub bind_address: String,
    /// Backend settings
    pub backend: BackendSettings,
    /// History settings
    pub history: HistorySettings,
    /// Search settings
    pub search: SearchConfig,
    /// Static tokens (token to user id)
    pub auth_tokens: HashMap<String, String>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of each overridable value
    sources: ConfigSources,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            backend: BackendSettings::default(),
            history: HistorySettings::default(),
            search: SearchConfig::default(),
            auth_tokens: HashMap::new(),
            config_file_path: None,
            sources: ConfigSources::default(),
        }
    }
}

impl ConductorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority source that set any value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.sources
            .all()
            .into_iter()
            .max_by_key(|source| source.priority())
            .unwrap_or(ConfigSource::Default)
    }

    /// Source of each overridable value
    #[must_use]
    pub fn sources(&self) -> &ConfigSources {
        &self.sources
    }

    /// Parsed listen address
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address.parse().map_err(|e| {
            ConfigError::ValidationError(format!(
                "bind_address '{}' is not a socket address: {e}",
                self.bind_address
            ))
        })
    }

    /// Check values that would otherwise fail later at runtime
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend.base_url must not be empty".to_string(),
            ));
        }
        if self.backend.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend.default_model must not be empty".to_string(),
            ));
        }
        if self.history.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "history.max_turns must be at least 1".to_string(),
            ));
        }
        if self.search.max_results == 0 {
            return Err(ConfigError::ValidationError(
                "search.max_results must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/kunlab/conductor.toml` or
/// `~/.config/kunlab/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kunlab").join("conductor.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConductorConfig, ConfigError> {
    let mut config = ConductorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConductorConfig, toml: ConductorToml) {
    if let Some(addr) = toml.server.bind_address {
        config.bind_address = addr;
        config.sources.bind_address = ConfigSource::File;
    }

    let backend = toml.backend;
    if let Some(url) = backend.base_url {
        config.backend.base_url = url;
        config.sources.backend_url = ConfigSource::File;
    }
    if let Some(ms) = backend.connect_timeout_ms {
        config.backend.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = backend.read_timeout_secs {
        config.backend.read_timeout = Duration::from_secs(secs);
    }
    if let Some(size) = backend.pool_size {
        config.backend.pool_size = size;
        config.sources.pool_size = ConfigSource::File;
    }
    if let Some(model) = backend.default_model {
        config.backend.default_model = model;
        config.sources.default_model = ConfigSource::File;
    }
    if let Some(policy) = backend.eviction {
        config.backend.eviction = policy;
    }

    if let Some(turns) = toml.history.max_turns {
        config.history.max_turns = turns;
        config.sources.max_turns = ConfigSource::File;
    }
    if let Some(chars) = toml.history.max_document_chars {
        config.history.max_document_chars = chars;
    }

    let search = toml.search;
    if search.api_key.is_some() {
        config.search.api_key = search.api_key;
        config.sources.search_api_key = ConfigSource::File;
    }
    if let Some(url) = search.base_url {
        config.search.base_url = url;
    }
    if let Some(n) = search.max_results {
        config.search.max_results = n;
    }
    if let Some(depth) = search.search_depth {
        config.search.search_depth = depth;
    }
    if let Some(secs) = search.timeout_secs {
        config.search.timeout = Duration::from_secs(secs);
    }

    config.auth_tokens.extend(toml.auth.tokens);
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = raw, "Ignoring unparseable environment value");
    }
    parsed
}

/// Apply environment variable overrides using `lookup` to read variables
fn apply_env_config(config: &mut ConductorConfig, lookup: impl Fn(&str) -> Option<String>) {
    let parsed = |key: &str| lookup(key).and_then(|raw| parse_env(key, &raw));

    if let Some(url) = lookup("OLLAMA_BASE_URL") {
        config.backend.base_url = url;
        config.sources.backend_url = ConfigSource::Env;
    }
    if let Some(addr) = lookup("CONDUCTOR_BIND") {
        config.bind_address = addr;
        config.sources.bind_address = ConfigSource::Env;
    }
    if let Some(size) = parsed("CONDUCTOR_POOL_SIZE") {
        config.backend.pool_size = size;
        config.sources.pool_size = ConfigSource::Env;
    }
    if let Some(model) = lookup("CONDUCTOR_DEFAULT_MODEL") {
        config.backend.default_model = model;
        config.sources.default_model = ConfigSource::Env;
    }
    if let Some(turns) = parsed("CONDUCTOR_MAX_TURNS") {
        config.history.max_turns = turns;
        config.sources.max_turns = ConfigSource::Env;
    }
    // Tried after the file key, which keeps the tag when both are set
    if let Some(key) = lookup("TAVILY_API_KEY").filter(|k| !k.trim().is_empty()) {
        config.search.env_api_key = Some(key);
        if config.search.api_key.is_none() {
            config.sources.search_api_key = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_address: Option<String>,
    /// Backend base URL override
    pub backend_url: Option<String>,
    /// Pool size override
    pub pool_size: Option<usize>,
    /// Default model override
    pub default_model: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind_address(mut self, addr: String) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set backend URL override
    #[must_use]
    pub fn with_backend_url(mut self, url: String) -> Self {
        self.backend_url = Some(url);
        self
    }

    /// Set pool size override
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ConductorConfig) {
        if let Some(ref addr) = self.bind_address {
            config.bind_address = addr.clone();
            config.sources.bind_address = ConfigSource::Cli;
        }
        if let Some(ref url) = self.backend_url {
            config.backend.base_url = url.clone();
            config.sources.backend_url = ConfigSource::Cli;
        }
        if let Some(size) = self.pool_size {
            config.backend.pool_size = size;
            config.sources.pool_size = ConfigSource::Cli;
        }
        if let Some(ref model) = self.default_model {
            config.backend.default_model = model.clone();
            config.sources.default_model = ConfigSource::Cli;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ConductorConfig::default();

        assert_eq!(config.bind_address, "127.0.0.1:8000");
        assert_eq!(config.backend.base_url, "http://localhost:11434");
        assert_eq!(config.backend.default_model, "llama2");
        assert_eq!(config.backend.eviction, EvictionPolicy::FirstSlot);
        assert_eq!(config.backend.read_timeout, Duration::from_secs(1800));
        assert_eq!(config.history.max_turns, 20);
        assert_eq!(config.history.max_document_chars, 200_000);
        assert_eq!(config.search.max_results, 5);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_size_uses_cpu_count() {
        let backend = BackendSettings {
            pool_size: 0,
            ..Default::default()
        };
        assert!(backend.effective_pool_size() >= 1);
    }

    // =========================================================================
    // File Loading Tests
    // =========================================================================

    #[test]
    fn test_load_from_file() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:9000"

[backend]
base_url = "http://gpu-box:11434"
pool_size = 2
default_model = "mistral"
eviction = "round_robin"

[history]
max_turns = 10

[auth.tokens]
"tok-1" = "alice"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let mut config = ConductorConfig::default();
        let parsed: ConductorToml = toml::from_str(toml_content).unwrap();
        apply_toml_config(&mut config, parsed);

        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.backend.base_url, "http://gpu-box:11434");
        assert_eq!(config.backend.pool_size, 2);
        assert_eq!(config.backend.default_model, "mistral");
        assert_eq!(config.backend.eviction, EvictionPolicy::RoundRobin);
        assert_eq!(config.history.max_turns, 10);
        assert_eq!(config.auth_tokens.get("tok-1").map(String::as_str), Some("alice"));

        let loaded = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(loaded.config_file_path.as_deref(), Some(file.path()));
        assert_eq!(loaded.backend.pool_size, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/kunlab/conductor.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.history.max_turns, 20);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[backend]\npool_size = \"many\"\n").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let mut config = ConductorConfig::default();
        let parsed: ConductorToml =
            toml::from_str("[backend]\ndefault_model = \"file-model\"\npool_size = 3\n").unwrap();
        apply_toml_config(&mut config, parsed);
        assert_eq!(config.sources().default_model, ConfigSource::File);

        apply_env_config(
            &mut config,
            env(&[
                ("CONDUCTOR_DEFAULT_MODEL", "env-model"),
                ("CONDUCTOR_POOL_SIZE", "not-a-number"),
                ("TAVILY_API_KEY", "tvly-env"),
            ]),
        );

        assert_eq!(config.backend.default_model, "env-model");
        // Unparseable values are ignored
        assert_eq!(config.backend.pool_size, 3);
        assert_eq!(config.search.env_api_key.as_deref(), Some("tvly-env"));

        let sources = config.sources();
        assert_eq!(sources.default_model, ConfigSource::Env);
        assert_eq!(sources.pool_size, ConfigSource::File);
        assert_eq!(sources.search_api_key, ConfigSource::Env);
        assert_eq!(sources.bind_address, ConfigSource::Default);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = ConductorConfig::default();
        apply_env_config(&mut config, env(&[("CONDUCTOR_BIND", "127.0.0.1:7000")]));

        ConfigOverrides::new()
            .with_bind_address("127.0.0.1:7100".to_string())
            .apply(&mut config);

        assert_eq!(config.bind_address, "127.0.0.1:7100");
        assert_eq!(config.sources().bind_address, ConfigSource::Cli);
        assert_eq!(config.sources().backend_url, ConfigSource::Default);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_sources_tracked_per_value() {
        let mut config = ConductorConfig::default();
        let parsed: ConductorToml = toml::from_str(
            "[server]\nbind_address = \"0.0.0.0:9000\"\n[search]\napi_key = \"tvly-file\"\n",
        )
        .unwrap();
        apply_toml_config(&mut config, parsed);
        apply_env_config(
            &mut config,
            env(&[("CONDUCTOR_MAX_TURNS", "8"), ("TAVILY_API_KEY", "tvly-env")]),
        );
        ConfigOverrides::new().with_pool_size(2).apply(&mut config);

        let sources = config.sources();
        assert_eq!(sources.bind_address, ConfigSource::File);
        assert_eq!(sources.max_turns, ConfigSource::Env);
        assert_eq!(sources.pool_size, ConfigSource::Cli);
        assert_eq!(sources.default_model, ConfigSource::Default);
        // The file key is tried before the environment key
        assert_eq!(sources.search_api_key, ConfigSource::File);
        assert_eq!(config.history.max_turns, 8);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = ConductorConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ConductorConfig::default();
        config.bind_address = "not an address".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ConductorConfig::default();
        config.history.max_turns = 0;
        assert!(config.validate().is_err());

        let mut config = ConductorConfig::default();
        config.backend.base_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::Cli), "CLI");
        assert_eq!(format!("{}", ConfigSource::Env), "environment");
        assert_eq!(format!("{}", ConfigSource::File), "config file");
        assert_eq!(format!("{}", ConfigSource::Default), "default");
    }
}
