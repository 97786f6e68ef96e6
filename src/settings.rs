// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    4
}

fn default_poll_interval() -> u64 {
    30
}

/// How changes below the repository root are noticed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Inspect the root: poll on network filesystems, events otherwise.
    #[default]
    Auto,
    Events,
    Poll,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Root directory holding one directory per repository.
    pub repository_path: PathBuf,
    /// Directory for the intermediate JSON artifacts.
    pub parsed_path: PathBuf,
    /// Seconds between full rescans in poll mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub watch_mode: WatchMode,
    /// List of regex for directories which are never treated as
    /// repositories. Matched against the path relative to the root.
    pub excludes: Option<Vec<String>>,
    pub debug: Option<bool>,
    pub database: Database,
}

impl Settings {
    pub fn new(config_file: String) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(&config_file).required(false))
            .add_source(Environment::with_prefix("CATALOG_SYNC").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn excludes(&self) -> Vec<String> {
        self.excludes.clone().unwrap_or_default()
    }
}
