//! Static worker specs derived from the `models` table.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::{gb_to_bytes, AppConfig, ConfigError, ModelType};

/// Program + arguments used to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchTemplate {
    /// Command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything the orchestrator needs to know about one alias. Never changes
/// after startup.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSpec {
    pub alias: String,
    pub model_type: ModelType,
    pub model_path: String,
    pub launch: LaunchTemplate,
    pub port: u16,
    pub memory_bytes: u64,
    pub idle_timeout: Duration,
}

fn default_command(python: &str, model_type: ModelType) -> Vec<String> {
    let module = format!("src.workers.{}_worker", model_type.as_str());
    [
        python,
        "-m",
        module.as_str(),
        "--alias",
        "{alias}",
        "--model_path",
        "{model_path}",
        "--port",
        "{port}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn substitute(arg: &str, alias: &str, port: u16, model_path: &str, model_type: ModelType) -> String {
    arg.replace("{alias}", alias)
        .replace("{port}", &port.to_string())
        .replace("{model_path}", model_path)
        .replace("{model_type}", model_type.as_str())
}

pub(crate) fn build_worker_specs(config: &AppConfig) -> Result<Vec<WorkerSpec>, ConfigError> {
    if config.models.is_empty() {
        return Err(ConfigError::NoModels);
    }

    let base = config.workers.base_port;
    let mut specs = Vec::with_capacity(config.models.len());
    let mut ports: HashMap<u16, String> = HashMap::new();
    // The servers' own ports are taken before any worker gets one
    let servers = [
        (config.gateway.port, "gateway"),
        (config.workers.manager_port, "manager"),
    ];
    for (port, name) in servers {
        if let Some(first) = ports.insert(port, name.to_string()) {
            return Err(ConfigError::DuplicatePort {
                first,
                second: name.to_string(),
                port,
            });
        }
    }

    for (index, (alias, model)) in config.models.iter().enumerate() {
        let port = match model.port {
            Some(port) => port,
            None => u16::try_from(index)
                .ok()
                .and_then(|i| base.checked_add(i))
                .ok_or_else(|| ConfigError::PortOverflow {
                    alias: alias.clone(),
                    base,
                    index,
                })?,
        };

        if let Some(first) = ports.insert(port, alias.clone()) {
            return Err(ConfigError::DuplicatePort {
                first,
                second: alias.clone(),
                port,
            });
        }

        let template = model
            .command
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| default_command(&config.workers.python, model.model_type));
        let mut parts = template
            .iter()
            .map(|arg| substitute(arg, alias, port, &model.path, model.model_type));
        // Non-empty by construction
        let program = parts.next().unwrap_or_default();
        let args = parts.collect();

        let memory_gb = model
            .memory_gb
            .unwrap_or_else(|| crate::estimate_memory_gb(&model.path, model.model_type));

        specs.push(WorkerSpec {
            alias: alias.clone(),
            model_type: model.model_type,
            model_path: model.path.clone(),
            launch: LaunchTemplate { program, args },
            port,
            memory_bytes: gb_to_bytes(memory_gb),
            idle_timeout: Duration::from_secs(
                model
                    .idle_timeout_seconds
                    .unwrap_or(config.workers.idle_timeout_seconds),
            ),
        });
    }

    Ok(specs)
}
