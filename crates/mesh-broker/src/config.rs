//! Broker configuration loading from file and environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use mesh_actions::StrategyConfig;
use mesh_cache::CacheConfig;
use mesh_uid::UidMode;

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Action result caching.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Correlation ID generation.
    #[serde(default)]
    pub uid: UidConfig,

    /// Load balancing between providers.
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Event mask matching.
    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Outbound request defaults.
    #[serde(default)]
    pub request: RequestConfig,
}

/// Node identity settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Logical node ID. Defaults to `<hostname>-<pid>`.
    #[serde(default)]
    pub id: Option<String>,
}

impl NodeConfig {
    /// The configured node ID, or the generated default.
    pub fn resolved_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => default_node_id(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "mesh_cache=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Correlation ID settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UidConfig {
    /// Generator variant.
    #[serde(default)]
    pub mode: UidMode,

    /// Prefix for the incremental generator. Defaults to the hostname,
    /// then the node ID.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Matcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    /// Number of compiled mask patterns kept.
    #[serde(default = "default_matcher_capacity")]
    pub cache_capacity: usize,
}

/// Outbound request settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestConfig {
    /// Default remote call deadline in milliseconds (`0` = none).
    #[serde(default)]
    pub timeout_ms: u64,
}

impl RequestConfig {
    /// The default deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_matcher_capacity() -> usize {
    mesh_events::Matcher::DEFAULT_CAPACITY
}

fn default_node_id() -> String {
    let host = mesh_uid::hostname().unwrap_or_else(|| "node".to_string());
    format!("{}-{}", host.to_lowercase(), std::process::id())
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_matcher_capacity(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `MESH_NODE_ID` overrides `node.id`
/// - `MESH_LOG_LEVEL` overrides `logging.level`
/// - `MESH_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `MESH_CACHE_TTL` overrides `cache.ttl`
/// - `MESH_CACHE_MAX_KEY_LENGTH` overrides `cache.max_key_length`
/// - `MESH_CACHE_FORMAT` overrides `cache.format`
/// - `MESH_UID_MODE` overrides `uid.mode`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<BrokerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                BrokerConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => BrokerConfig::default(),
    };

    apply_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies `MESH_*` overrides looked up through `var`. Unparseable values
/// are ignored with a warning.
pub fn apply_overrides(config: &mut BrokerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(id) = var("MESH_NODE_ID") {
        config.node.id = Some(id);
    }
    if let Some(level) = var("MESH_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("MESH_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(ttl) = var("MESH_CACHE_TTL") {
        match ttl.parse() {
            Ok(parsed) => config.cache.ttl = parsed,
            Err(_) => tracing::warn!(value = %ttl, "ignoring invalid MESH_CACHE_TTL"),
        }
    }
    if let Some(max) = var("MESH_CACHE_MAX_KEY_LENGTH") {
        match max.parse() {
            Ok(parsed) => config.cache.max_key_length = parsed,
            Err(_) => tracing::warn!(value = %max, "ignoring invalid MESH_CACHE_MAX_KEY_LENGTH"),
        }
    }
    if let Some(format) = var("MESH_CACHE_FORMAT") {
        config.cache.format = Some(format);
    }
    if let Some(mode) = var("MESH_UID_MODE") {
        match mode.parse() {
            Ok(parsed) => config.uid.mode = parsed,
            Err(e) => tracing::warn!("ignoring MESH_UID_MODE: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_actions::PolicyKind;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.matcher.cache_capacity, 128);
        assert_eq!(config.request.timeout(), None);
    }

    #[test]
    fn file_sections_are_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
id = "node-7"

[logging]
level = "debug"
json = true

[cache]
max_key_length = 60
ttl = 30
format = "json"

[uid]
mode = "standard"

[strategy]
policy = "random"
prefer_local = false

[matcher]
cache_capacity = 16

[request]
timeout_ms = 2500
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.node.resolved_id(), "node-7");
        assert!(config.logging.json);
        assert_eq!(config.cache.max_key_length, 60);
        assert_eq!(config.cache.ttl, 30);
        assert_eq!(config.cache.format.as_deref(), Some("json"));
        assert_eq!(config.uid.mode, UidMode::Standard);
        assert_eq!(config.strategy.policy, PolicyKind::Random);
        assert!(!config.strategy.prefer_local);
        assert_eq!(config.matcher.cache_capacity, 16);
        assert_eq!(config.request.timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache\nttl = ").unwrap();
        assert!(matches!(load_config(file.path().to_str()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("MESH_NODE_ID", "from-env"),
            ("MESH_LOG_JSON", "1"),
            ("MESH_CACHE_TTL", "90"),
            ("MESH_CACHE_MAX_KEY_LENGTH", "not-a-number"),
            ("MESH_CACHE_FORMAT", "msgpack"),
            ("MESH_UID_MODE", "uuid"),
        ]
        .into_iter()
        .collect();
        let mut config = BrokerConfig::default();
        apply_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.node.resolved_id(), "from-env");
        assert!(config.logging.json);
        assert_eq!(config.cache.ttl, 90);
        assert_eq!(config.cache.max_key_length, 0);
        assert_eq!(config.cache.format.as_deref(), Some("msgpack"));
        assert_eq!(config.uid.mode, UidMode::Standard);
    }

    #[test]
    fn blank_node_id_falls_back_to_generated() {
        let node = NodeConfig {
            id: Some("  ".to_string()),
        };
        let id = node.resolved_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }
}
