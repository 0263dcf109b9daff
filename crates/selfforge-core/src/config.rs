//! Runtime configuration, resolved once at startup from the environment
//! and passed down explicitly. There are no process-wide singletons.

use crate::error::{Error, Result};
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    /// LLM credential. Absence is fatal at startup for anything that talks
    /// to the provider.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Path to the tool manifest file (source of truth for the registry).
    pub manifest_path: PathBuf,
    /// Directory holding synthesized tool artifacts.
    pub tools_dir: PathBuf,
    /// SQLite database path for the experience store.
    pub db_path: PathBuf,
    pub bus_capacity: usize,
    /// Default per-tool execution deadline.
    pub tool_timeout_secs: u64,
    /// Manifest poll interval for the hot-reload watcher.
    pub watch_interval_ms: u64,
    pub port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("SELFFORGE_API_KEY")
                .or_else(|_| std::env::var("LLM_API_KEY"))
                .ok(),
            base_url: env_or("SELFFORGE_BASE_URL", "https://api.deepseek.com/v1"),
            model: env_or("SELFFORGE_MODEL", "deepseek-chat"),
            temperature: env_parse("SELFFORGE_TEMPERATURE", 0.3),
            max_tokens: env_parse("SELFFORGE_MAX_TOKENS", 2000),
            manifest_path: PathBuf::from(env_or("SELFFORGE_MANIFEST", "tools/manifest.json")),
            tools_dir: PathBuf::from(env_or("SELFFORGE_TOOLS_DIR", "tools/dynamic")),
            db_path: PathBuf::from(env_or("SELFFORGE_DB", "memory/experience.db")),
            bus_capacity: env_parse("SELFFORGE_BUS_CAPACITY", 256),
            tool_timeout_secs: env_parse("SELFFORGE_TOOL_TIMEOUT_SECS", 30),
            watch_interval_ms: env_parse("SELFFORGE_WATCH_INTERVAL_MS", 1000),
            port: env_parse("SELFFORGE_PORT", 18790),
        }
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Llm("SELFFORGE_API_KEY not set".to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.3,
            max_tokens: 2000,
            manifest_path: PathBuf::from("tools/manifest.json"),
            tools_dir: PathBuf::from("tools/dynamic"),
            db_path: PathBuf::from("memory/experience.db"),
            bus_capacity: 256,
            tool_timeout_secs: 30,
            watch_interval_ms: 1000,
            port: 18790,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_limits() {
        let cfg = Config::default();
        assert_eq!(cfg.tool_timeout_secs, 30);
        assert_eq!(cfg.watch_interval_ms, 1000);
        assert!(cfg.bus_capacity > 0);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let cfg = Config::default();
        assert!(cfg.require_api_key().is_err());
    }

    #[test]
    fn present_api_key_resolves() {
        let cfg = Config {
            api_key: Some("sk-test".into()),
            ..Config::default()
        };
        assert_eq!(cfg.require_api_key().unwrap(), "sk-test");
    }
}
