// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub fetch: FetchConfig,
}

/// The active plugin set: ordered descriptor URLs (or local script paths).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Limits for the plugin script engine.
///
/// Parser recursion and the size of script-owned strings, arrays and maps.
/// There is no CPU quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 1_048_576, // 1MB
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("plugbox/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let c = Config::default();
        assert!(c.plugins.urls.is_empty());
        assert_eq!(c.sandbox.max_expr_depth, 64);
        assert_eq!(c.sandbox.max_function_expr_depth, 32);
        assert_eq!(c.sandbox.max_string_size, 1_048_576);
        assert_eq!(c.sandbox.max_array_size, 10_000);
        assert_eq!(c.sandbox.max_map_size, 10_000);
        assert_eq!(c.fetch.timeout_seconds, 30);
        assert!(c.fetch.user_agent.starts_with("plugbox/"));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sandbox.max_expr_depth, 64);
        assert!(config.plugins.urls.is_empty());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[plugins]
urls = ["https://plugins.example.com/shout.json", "~/plugins/echo.rhai"]

[sandbox]
max_expr_depth = 128
max_function_expr_depth = 48
max_array_size = 500

[fetch]
timeout_seconds = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.urls.len(), 2);
        assert_eq!(config.sandbox.max_expr_depth, 128);
        assert_eq!(config.sandbox.max_function_expr_depth, 48);
        assert_eq!(config.sandbox.max_array_size, 500);
        assert_eq!(config.sandbox.max_map_size, 10_000);
        assert_eq!(config.fetch.timeout_seconds, 5);
        assert!(config.fetch.user_agent.starts_with("plugbox/"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.sandbox.max_expr_depth, config.sandbox.max_expr_depth);
        assert_eq!(deserialized.fetch.timeout_seconds, config.fetch.timeout_seconds);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }
}
