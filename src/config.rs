//! Daemon configuration
//!
//! Built-in defaults, optionally overridden by `~/.mobiledev/config.json` (or
//! the file given with `--config`), then by command-line flags.

use crate::agent::AgentSettings;
use crate::error::ConfigError;
use crate::exec::ExecSettings;
use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HTTP/WebSocket port
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to listen on. Mobile clients connect over the LAN.
    pub bind: String,
    pub port: u16,
    /// Working directory for every spawned process (default: current directory)
    pub project_root: Option<PathBuf>,
    pub exec_timeout_secs: u64,
    /// Delay between SIGTERM and SIGKILL when a command is cancelled
    pub kill_grace_secs: u64,
    pub keepalive_secs: u64,
    /// Environment variables passed through to executed commands
    pub forwarded_env: Vec<String>,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub allowed_tools: String,
    pub init_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            project_root: None,
            exec_timeout_secs: 60,
            kill_grace_secs: 5,
            keepalive_secs: 30,
            forwarded_env: ["PATH", "HOME", "USER", "LANG"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            allowed_tools: "Read,Write,Edit,Execute".to_string(),
            init_prompt: "You are now connected to a new session.".to_string(),
        }
    }
}

/// Get the default config file path
pub fn config_file() -> PathBuf {
    platform::config_dir().join("config.json")
}

/// Load configuration. An explicit path must exist; the default path may not.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_file();
            if !path.exists() {
                return Ok(Config::default());
            }
            path
        }
    };

    let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let config = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

impl Config {
    /// Canonical project root, defaulting to the current directory.
    pub fn resolve_root(&self) -> Result<PathBuf, ConfigError> {
        let root = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(|source| ConfigError::Root {
                path: PathBuf::from("."),
                source,
            })?,
        };
        let canonical = root
            .canonicalize()
            .map_err(|source| ConfigError::Root {
                path: root.clone(),
                source,
            })?;
        if !canonical.is_dir() {
            return Err(ConfigError::Root {
                path: root,
                source: std::io::Error::other("not a directory"),
            });
        }
        Ok(canonical)
    }

    pub fn exec_settings(&self, root: &Path) -> ExecSettings {
        ExecSettings {
            working_dir: root.to_path_buf(),
            timeout: Duration::from_secs(self.exec_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            forwarded_env: self.forwarded_env.clone(),
        }
    }

    pub fn agent_settings(&self, root: &Path) -> AgentSettings {
        AgentSettings {
            command: self.agent.command.clone(),
            base_args: self.agent.args.clone(),
            allowed_tools: self.agent.allowed_tools.clone(),
            init_prompt: self.agent.init_prompt.clone(),
            working_dir: root.to_path_buf(),
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}
