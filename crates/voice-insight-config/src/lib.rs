//! Configuration for the Voice Insight gateway and worker manager.
//!
//! Loaded once at startup from a JSON file, then patched with a small set of
//! environment overrides. The static [`WorkerSpec`] table the orchestrator
//! runs on is derived from it by [`AppConfig::worker_specs`].

pub mod memory;
pub mod spec;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use memory::{estimate_memory_gb, gb_to_bytes, BYTES_PER_GB};
pub use spec::{LaunchTemplate, WorkerSpec};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("no models configured")]
    NoModels,
    #[error("{first} and {second} both use port {port}")]
    DuplicatePort {
        first: String,
        second: String,
        port: u16,
    },
    #[error("model {alias}: port {base} + {index} does not fit in u16")]
    PortOverflow { alias: String, base: u16, index: usize },
}

/// Kind of model a worker serves. Picks the default worker module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Stt,
    Tts,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Tts => "tts",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `models` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Model path or hub id handed to the worker.
    pub path: String,
    /// Memory estimate; falls back to [`estimate_memory_gb`] when absent.
    #[serde(default)]
    pub memory_gb: Option<f64>,
    /// Fixed port override. Normally derived as `base_port + index`.
    #[serde(default)]
    pub port: Option<u16>,
    /// Per-model idle timeout override.
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    /// Launch command template. `{alias}`, `{port}`, `{model_path}` and
    /// `{model_type}` are substituted.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Opaque worker parameters, reported in the catalog only.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_unified_memory_gb: f64,
    pub safety_margin_gb: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_unified_memory_gb: 24.0,
            safety_margin_gb: 2.0,
        }
    }
}

impl MemoryConfig {
    /// Bytes the orchestrator may hand out to workers.
    pub fn budget_bytes(&self) -> u64 {
        gb_to_bytes((self.max_unified_memory_gb - self.safety_margin_gb).max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Empty disables API key checks.
    pub api_key: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8200,
            api_key: String::new(),
        }
    }
}

/// Worker manager settings. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub manager_port: u16,
    pub base_port: u16,
    /// Host the workers listen on, as seen from the manager.
    pub worker_host: String,
    /// Interpreter used by the default launch template.
    pub python: String,
    pub idle_timeout_seconds: u64,
    pub idle_check_interval: u64,
    pub health_check_interval: u64,
    pub health_failure_threshold: u32,
    pub startup_timeout: u64,
    pub cold_start_timeout: u64,
    pub request_timeout: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            manager_port: 8210,
            base_port: 8211,
            worker_host: "127.0.0.1".to_string(),
            python: "python3".to_string(),
            idle_timeout_seconds: 300,
            idle_check_interval: 30,
            health_check_interval: 30,
            health_failure_threshold: 3,
            startup_timeout: 120,
            cold_start_timeout: 130,
            request_timeout: 120,
            shutdown_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Keyed by alias. A BTreeMap keeps the derived port assignment stable.
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl AppConfig {
    /// Parse a config document without touching the environment.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(json)?;
        if config.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        Ok(config)
    }

    /// Apply `GATEWAY_PORT`, `GATEWAY_API_KEY`, `MANAGER_PORT`, `BASE_PORT`
    /// and `IDLE_TIMEOUT` from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_env(&lookup, "GATEWAY_PORT")? {
            self.gateway.port = port;
        }
        if let Some(key) = lookup("GATEWAY_API_KEY").filter(|v| !v.is_empty()) {
            self.gateway.api_key = key;
        }
        if let Some(port) = parse_env(&lookup, "MANAGER_PORT")? {
            self.workers.manager_port = port;
        }
        if let Some(port) = parse_env(&lookup, "BASE_PORT")? {
            self.workers.base_port = port;
        }
        if let Some(secs) = parse_env(&lookup, "IDLE_TIMEOUT")? {
            self.workers.idle_timeout_seconds = secs;
        }
        Ok(())
    }

    pub fn worker_specs(&self) -> Result<Vec<WorkerSpec>, ConfigError> {
        spec::build_worker_specs(self)
    }
}

fn parse_env<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
        _ => Ok(None),
    }
}

/// Load configuration from `path` and apply process environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut config = AppConfig::from_json(&raw)?;
    config.apply_env_overrides(|var| std::env::var(var).ok())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"{
        "models": {
            "stt-fast": { "type": "stt", "path": "mlx-community/whisper-large-v3-turbo" },
            "tts-fast": { "type": "tts", "path": "mlx-community/Kokoro-82M-bf16", "idle_timeout_seconds": 600 }
        },
        "memory": { "max_unified_memory_gb": 24, "safety_margin_gb": 2.0 },
        "workers": { "manager_port": 8100 }
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_json(SAMPLE).unwrap();
        assert!(config.models.contains_key("stt-fast"));
        assert!(config.models.contains_key("tts-fast"));
        assert_eq!(config.memory.max_unified_memory_gb, 24.0);
        assert_eq!(config.memory.safety_margin_gb, 2.0);
        assert_eq!(config.workers.manager_port, 8100);
        // Untouched sections keep their defaults
        assert_eq!(config.workers.idle_timeout_seconds, 300);
        assert_eq!(config.gateway.port, 8200);
    }

    #[test]
    fn test_empty_models_rejected() {
        let err = AppConfig::from_json(r#"{"models": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoModels));
    }

    #[test]
    fn test_unknown_model_type_rejected() {
        let err = AppConfig::from_json(r#"{"models": {"x": {"type": "llm", "path": "p"}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_budget_subtracts_safety_margin() {
        let memory = MemoryConfig {
            max_unified_memory_gb: 6.0,
            safety_margin_gb: 2.0,
        };
        assert_eq!(memory.budget_bytes(), 4 * BYTES_PER_GB);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::from_json(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("GATEWAY_PORT", "9000"),
            ("MANAGER_PORT", "9010"),
            ("BASE_PORT", "9100"),
            ("IDLE_TIMEOUT", "42"),
            ("GATEWAY_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.workers.manager_port, 9010);
        assert_eq!(config.workers.base_port, 9100);
        assert_eq!(config.workers.idle_timeout_seconds, 42);
        assert_eq!(config.gateway.api_key, "secret");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = AppConfig::from_json(SAMPLE).unwrap();
        let err = config
            .apply_env_overrides(|var| (var == "BASE_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BASE_PORT"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
