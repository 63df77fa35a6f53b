// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration management for the experiment scheduler.
//!
//! Precedence, highest to lowest:
//! 1. CLI arguments (applied by the caller on top of the loaded [`SchedulerConfig`]/[`WorkerConfig`])
//! 2. Environment variables (prefixed with `SCHEDULER_`)
//! 3. Config file (`~/.config/experiment-scheduler/config.toml` or `./config.toml`)
//! 4. Defaults
//!
//! # Examples
//!
//! ```no_run
//! use scheduler_core::config::ConfigLoader;
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = ConfigLoader::new().load()?;
//! println!("polling interval: {}s", config.scheduler.polling_secs);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name.
const CONFIG_DIR_NAME: &str = "experiment-scheduler";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SCHEDULER";

/// Environment variable separator for nested configuration, e.g.
/// `SCHEDULER_SCHEDULER__POLLING_SECS`.
const ENV_SEPARATOR: &str = "__";

/// Root configuration, covering both the `schedule` and `work` binaries.
/// Most fields are also settable as CLI flags (spec §6); CLI flags take
/// precedence over everything loaded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Settings for the `schedule` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Defaults to the local hostname at CLI parse time; `None` here means
    /// "not yet resolved", left for the CLI layer to fill in.
    pub name: Option<String>,
    pub dashboard_port: u16,
    pub polling_secs: u64,
    /// Open question (spec §9): whether a reaped failed host's abandoned
    /// jobs are explicitly marked FAILED, or left at their last observed
    /// status (the literal spec behavior, and the default here).
    pub mark_abandoned_jobs_failed: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: None,
            dashboard_port: 9200,
            polling_secs: 1,
            mark_abandoned_jobs_failed: false,
        }
    }
}

/// Settings for the `work` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub port: u16,
    pub file_server_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 9100,
            file_server_port: 9101,
        }
    }
}

/// Logging knobs layered on top of `RUST_LOG`/`SCHEDULER_LOG` env filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory rotating log files are written to. Defaults to the current
    /// directory, next to the process's working directory.
    pub log_dir: PathBuf,
    pub max_file_bytes: u64,
    pub max_backups: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            max_file_bytes: 10 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

/// Configuration loader with builder pattern.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    custom_file: Option<PathBuf>,
    skip_default_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of the default config file location.
    #[must_use]
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    #[must_use]
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load configuration from defaults, then config file, then environment
    /// variables, in that order (later sources override earlier).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file fails to parse or deserialize.
    pub fn load(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        let defaults = Config::default();
        let defaults_map = config_to_map(&defaults)?;
        builder = builder.add_source(config::Config::try_from(&defaults_map)?);

        if !self.skip_default_file {
            if let Some(config_path) = self.find_config_file() {
                tracing::debug!("loading config from {}", config_path.display());
                builder = builder.add_source(
                    File::from(config_path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        if let Some(ref custom_path) = self.custom_file {
            tracing::info!("loading custom config from {}", custom_path.display());
            builder = builder.add_source(
                File::from(custom_path.as_ref())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let config_result = builder.build().context("failed to build configuration")?;
        let config: Config = config_result
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        Ok(config)
    }

    /// Search `$XDG_CONFIG_HOME/experiment-scheduler/config.toml` (or the
    /// platform equivalent), falling back to `./config.toml`.
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        let local_config = PathBuf::from(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Some(local_config);
        }

        None
    }

    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

fn config_to_map(config: &Config) -> Result<serde_json::Value, ConfigError> {
    serde_json::to_value(config).map_err(|e| ConfigError::Foreign(Box::new(e)))
}

/// Create a default config file at the standard location, failing if one
/// already exists there.
///
/// # Errors
///
/// Returns an error if the config directory cannot be determined or
/// created, the file already exists, or it cannot be written.
pub fn init_config_file() -> Result<PathBuf> {
    let config_dir =
        ConfigLoader::default_config_dir().context("could not determine config directory")?;

    std::fs::create_dir_all(&config_dir).context("failed to create config directory")?;

    let config_path = config_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        anyhow::bail!("config file already exists at: {}", config_path.display());
    }

    let default_config = Config::default();
    let toml_content =
        toml::to_string_pretty(&default_config).context("failed to serialize default config")?;

    std::fs::write(&config_path, toml_content).context("failed to write config file")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_cli_flag_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.dashboard_port, 9200);
        assert_eq!(config.scheduler.polling_secs, 1);
        assert_eq!(config.worker.port, 9100);
        assert_eq!(config.worker.file_server_port, 9101);
        assert!(!config.scheduler.mark_abandoned_jobs_failed);
    }

    #[test]
    fn load_default_config_skips_file_and_env() {
        let loader = ConfigLoader::new().skip_default_file().skip_env();
        let config = loader.load().expect("default config should load");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_from_custom_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        std::fs::write(
            &config_path,
            r#"
[scheduler]
dashboard_port = 9999
polling_secs = 5

[worker]
port = 9500
            "#,
        )
        .unwrap();

        let loader = ConfigLoader::new().with_file(&config_path).skip_env();
        let config = loader.load().expect("custom config should load");

        assert_eq!(config.scheduler.dashboard_port, 9999);
        assert_eq!(config.scheduler.polling_secs, 5);
        assert_eq!(config.worker.port, 9500);
        // Untouched fields keep their defaults.
        assert_eq!(config.worker.file_server_port, 9101);
    }

    #[test]
    fn environment_variable_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[scheduler]\npolling_secs = 5\n").unwrap();

        std::env::set_var("SCHEDULER_SCHEDULER__POLLING_SECS", "15");

        let loader = ConfigLoader::new().with_file(&config_path);
        let config = loader.load().expect("config with env override should load");

        assert_eq!(config.scheduler.polling_secs, 15);

        std::env::remove_var("SCHEDULER_SCHEDULER__POLLING_SECS");
    }

    #[test]
    fn default_config_dir_contains_crate_name() {
        let config_dir = ConfigLoader::default_config_dir();
        assert!(config_dir.is_some());
        if let Some(dir) = config_dir {
            assert!(dir.to_string_lossy().contains("experiment-scheduler"));
        }
    }
}
