//! `netdeploy serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use netdeploy::config::{NetdeployConfig, RunnerKind, StorageBackend};

/// Command-line flags that win over file and environment settings.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub storage: Option<StorageBackend>,
    pub runner: Option<RunnerKind>,
    pub runner_cmd: Option<String>,
}

impl ServeOverrides {
    pub fn apply(self, config: &mut NetdeployConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(db_path) = self.db_path {
            config.storage.db_path = db_path;
        }
        if self.dev {
            config.server.dev_mode = true;
        }
        if let Some(storage) = self.storage {
            config.storage.backend = storage;
        }
        if let Some(command) = self.runner_cmd {
            config.runner.command = command;
            config.runner.kind = RunnerKind::Process;
        }
        if let Some(runner) = self.runner {
            config.runner.kind = runner;
        }
    }
}

/// Explicit config file, else `.netdeploy/config.toml` under `project_dir`.
pub fn load_config(project_dir: &Path, config_file: Option<&Path>) -> Result<NetdeployConfig> {
    match config_file {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file {} not found", path.display());
            }
            let mut config = NetdeployConfig::from_file(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => NetdeployConfig::load(project_dir),
    }
}

pub async fn cmd_serve(mut config: NetdeployConfig, overrides: ServeOverrides) -> Result<()> {
    overrides.apply(&mut config);
    netdeploy::deploy::server::start_server(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = NetdeployConfig::default();
        ServeOverrides {
            port: Some(9999),
            db_path: Some(PathBuf::from("/tmp/x.db")),
            dev: true,
            storage: Some(StorageBackend::Memory),
            runner: None,
            runner_cmd: Some("my-runner".to_string()),
        }
        .apply(&mut config);

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/x.db"));
        assert!(config.server.dev_mode);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.runner.command, "my-runner");
        assert_eq!(config.runner.kind, RunnerKind::Process);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = NetdeployConfig::default();
        ServeOverrides::default().apply(&mut config);
        assert_eq!(config, NetdeployConfig::default());
    }

    #[test]
    fn test_missing_explicit_config_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config(dir.path(), Some(&missing)).is_err());
    }
}
