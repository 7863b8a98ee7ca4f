//! Server configuration.
//!
//! Resolution order, lowest to highest precedence:
//! built-in defaults, `.netdeploy/config.toml`, `NETDEPLOY_*` environment
//! variables, then command-line flags (applied by the `serve` command).
//!
//! ```toml
//! [server]
//! port = 8080
//! dev_mode = true
//!
//! [storage]
//! backend = "sqlite"
//! db_path = ".netdeploy/netdeploy.db"
//!
//! [runner]
//! kind = "process"
//! command = "netdeploy-runner"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::deploy::lifecycle::DEFAULT_CAS_RETRIES;
use crate::deploy::tailer::{DEFAULT_MAX_LINES, MAX_LINES_CAP};

pub const CONFIG_DIR: &str = ".netdeploy";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            _ => anyhow::bail!("Invalid storage backend '{}'. Valid values: memory, sqlite", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Process,
    Scripted,
}

impl std::str::FromStr for RunnerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(RunnerKind::Process),
            "scripted" => Ok(RunnerKind::Scripted),
            _ => anyhow::bail!("Invalid runner kind '{}'. Valid values: process, scripted", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: u16,
    pub dev_mode: bool,
}

impl ServerSettings {
    /// Explicit host, else all interfaces in dev mode and loopback otherwise.
    pub fn bind_host(&self) -> &str {
        match &self.host {
            Some(host) => host,
            None if self.dev_mode => "0.0.0.0",
            None => "127.0.0.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub db_path: PathBuf,
    /// Drop session events and recorded logs when a deployment is stopped.
    pub prune_on_stop: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub kind: RunnerKind,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub default_max_lines: usize,
    pub max_lines_cap: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub cas_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Also write daily-rotated log files here.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetdeployConfig {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub runner: RunnerSettings,
    pub logs: LogSettings,
    pub lifecycle: LifecycleSettings,
    pub logging: LoggingSettings,
}

impl Default for NetdeployConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: None,
                port: 8080,
                dev_mode: false,
            },
            storage: StorageSettings {
                backend: StorageBackend::default(),
                db_path: PathBuf::from(CONFIG_DIR).join("netdeploy.db"),
                prune_on_stop: true,
            },
            runner: RunnerSettings {
                kind: RunnerKind::default(),
                command: "netdeploy-runner".to_string(),
                args: Vec::new(),
            },
            logs: LogSettings {
                default_max_lines: DEFAULT_MAX_LINES,
                max_lines_cap: MAX_LINES_CAP,
            },
            lifecycle: LifecycleSettings {
                cas_retries: DEFAULT_CAS_RETRIES,
            },
            logging: LoggingSettings::default(),
        }
    }
}

/// Raw TOML structure for `.netdeploy/config.toml`
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    server: Option<ServerSection>,
    storage: Option<StorageSection>,
    runner: Option<RunnerSection>,
    logs: Option<LogsSection>,
    lifecycle: Option<LifecycleSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    backend: Option<StorageBackend>,
    db_path: Option<PathBuf>,
    prune_on_stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RunnerSection {
    kind: Option<RunnerKind>,
    command: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LogsSection {
    default_max_lines: Option<usize>,
    max_lines_cap: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LifecycleSection {
    cas_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    format: Option<LogFormat>,
    dir: Option<PathBuf>,
}

impl NetdeployConfig {
    /// Load `.netdeploy/config.toml` under `project_dir`, then apply the
    /// process environment. Missing file means defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults merged with `path` if it exists.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let toml: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.server.host = Some(host);
            }
            if let Some(port) = server.port {
                config.server.port = port;
            }
            if let Some(dev_mode) = server.dev_mode {
                config.server.dev_mode = dev_mode;
            }
        }
        if let Some(storage) = toml.storage {
            if let Some(backend) = storage.backend {
                config.storage.backend = backend;
            }
            if let Some(db_path) = storage.db_path {
                config.storage.db_path = db_path;
            }
            if let Some(prune) = storage.prune_on_stop {
                config.storage.prune_on_stop = prune;
            }
        }
        if let Some(runner) = toml.runner {
            if let Some(kind) = runner.kind {
                config.runner.kind = kind;
            }
            if let Some(command) = runner.command {
                config.runner.command = command;
            }
            if let Some(args) = runner.args {
                config.runner.args = args;
            }
        }
        if let Some(logs) = toml.logs {
            if let Some(cap) = logs.max_lines_cap {
                config.logs.max_lines_cap = cap;
            }
            if let Some(default_max) = logs.default_max_lines {
                config.logs.default_max_lines = default_max;
            }
        }
        if let Some(lifecycle) = toml.lifecycle
            && let Some(retries) = lifecycle.cas_retries
        {
            config.lifecycle.cas_retries = retries;
        }
        if let Some(logging) = toml.logging {
            if let Some(format) = logging.format {
                config.logging.format = format;
            }
            if let Some(dir) = logging.dir {
                config.logging.dir = Some(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `NETDEPLOY_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("NETDEPLOY_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid NETDEPLOY_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("NETDEPLOY_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(command) = lookup("NETDEPLOY_RUNNER_CMD") {
            self.runner.command = command;
            self.runner.kind = RunnerKind::Process;
        }
        if let Some(backend) = lookup("NETDEPLOY_STORAGE") {
            self.storage.backend = backend.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.logs.max_lines_cap == 0 {
            anyhow::bail!("logs.max_lines_cap must be at least 1");
        }
        if self.logs.default_max_lines == 0 || self.logs.default_max_lines > self.logs.max_lines_cap
        {
            anyhow::bail!(
                "logs.default_max_lines must be between 1 and {}",
                self.logs.max_lines_cap
            );
        }
        if self.runner.kind == RunnerKind::Process && self.runner.command.trim().is_empty() {
            anyhow::bail!("runner.command must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = NetdeployConfig::from_file(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, NetdeployConfig::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(config.storage.prune_on_stop);
        assert_eq!(config.logs.default_max_lines, 100);
        assert_eq!(config.lifecycle.cas_retries, 3);
    }

    #[test]
    fn test_load_reads_project_config() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            r#"
[server]
port = 9000
dev_mode = true

[storage]
backend = "memory"
prune_on_stop = false

[runner]
kind = "scripted"

[logs]
default_max_lines = 50
max_lines_cap = 500

[lifecycle]
cas_retries = 5

[logging]
format = "json"
dir = "/var/log/netdeploy"
"#,
        )
        .unwrap();

        let config = NetdeployConfig::from_file(&config_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_host(), "0.0.0.0");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(!config.storage.prune_on_stop);
        assert_eq!(config.runner.kind, RunnerKind::Scripted);
        assert_eq!(config.logs.default_max_lines, 50);
        assert_eq!(config.logs.max_lines_cap, 500);
        assert_eq!(config.lifecycle.cas_retries, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.logging.dir,
            Some(PathBuf::from("/var/log/netdeploy"))
        );
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = NetdeployConfig::parse("[server]\nport = 3000\n").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind_host(), "127.0.0.1");
        assert_eq!(config.runner.command, "netdeploy-runner");
    }

    #[test]
    fn test_explicit_host_wins_over_dev_mode() {
        let config =
            NetdeployConfig::parse("[server]\nhost = \"10.0.0.5\"\ndev_mode = true\n").unwrap();
        assert_eq!(config.server.bind_host(), "10.0.0.5");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(NetdeployConfig::parse("[storage]\nbackend = \"postgres\"\n").is_err());
        assert!(NetdeployConfig::parse("[logs]\ndefault_max_lines = 0\n").is_err());
        assert!(
            NetdeployConfig::parse("[logs]\ndefault_max_lines = 20\nmax_lines_cap = 10\n")
                .is_err()
        );
        assert!(NetdeployConfig::parse("[runner]\ncommand = \"  \"\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = NetdeployConfig::parse("[server]\nport = 3000\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("NETDEPLOY_PORT", "4000"),
            ("NETDEPLOY_DB_PATH", "/tmp/nd.db"),
            ("NETDEPLOY_STORAGE", "memory"),
            ("NETDEPLOY_RUNNER_CMD", "/usr/local/bin/runner"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/nd.db"));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.runner.command, "/usr/local/bin/runner");
        assert_eq!(config.runner.kind, RunnerKind::Process);
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = NetdeployConfig::default();
        let err = config
            .apply_env(|key| (key == "NETDEPLOY_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("NETDEPLOY_PORT"));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("SQLite".parse::<StorageBackend>().unwrap(), StorageBackend::Sqlite);
        assert_eq!("scripted".parse::<RunnerKind>().unwrap(), RunnerKind::Scripted);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
