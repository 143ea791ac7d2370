//! Player configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::LaunchOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<PathBuf>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// IPC socket/pipe path (None = fresh per-instance path).
  #[serde(default)]
  pub socket_path: Option<String>,

  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,

  /// Time MPV gets to exit on its own before it is killed.
  #[serde(default = "default_shutdown_grace_ms")]
  pub shutdown_grace_ms: u64,

  /// Keep the last frame on screen when playback ends.
  #[serde(default = "default_keep_open")]
  pub keep_open: bool,

  #[serde(default = "default_output_tail_lines")]
  pub output_tail_lines: usize,
}

fn default_connect_timeout_ms() -> u64 {
  5000
}

fn default_request_timeout_ms() -> u64 {
  5000
}

fn default_shutdown_grace_ms() -> u64 {
  2000
}

fn default_keep_open() -> bool {
  true
}

fn default_output_tail_lines() -> usize {
  50
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      socket_path: None,
      connect_timeout_ms: default_connect_timeout_ms(),
      request_timeout_ms: default_request_timeout_ms(),
      shutdown_grace_ms: default_shutdown_grace_ms(),
      keep_open: default_keep_open(),
      output_tail_lines: default_output_tail_lines(),
    }
  }
}

impl PlayerConfig {
  /// `<config dir>/mpvbridge/config.json`, if the platform has a config dir.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mpvbridge").join("config.json"))
  }

  /// Load from `path`, or from [`PlayerConfig::default_path`] when none is given.
  ///
  /// A missing file yields the defaults; an explicit path must exist.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let (path, required) = match path {
      Some(path) => (path.to_path_buf(), true),
      None => match Self::default_path() {
        Some(path) => (path, false),
        None => return Ok(Self::default()),
      },
    };

    let text = match std::fs::read_to_string(&path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
        log::debug!("No config at {:?}, using defaults", path);
        return Ok(Self::default());
      }
      Err(source) => return Err(ConfigError::Io { path, source }),
    };

    let config: Self =
      serde_json::from_str(&text).map_err(|source| ConfigError::Json { path: path.clone(), source })?;
    config.validate()?;
    log::info!("Loaded config from {:?}", path);
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.connect_timeout_ms == 0 {
      return Err(ConfigError::Invalid("connectTimeoutMs must be positive".into()));
    }
    if self.request_timeout_ms == 0 {
      return Err(ConfigError::Invalid("requestTimeoutMs must be positive".into()));
    }
    if self.shutdown_grace_ms == 0 {
      return Err(ConfigError::Invalid("shutdownGraceMs must be positive".into()));
    }
    if self.mpv_args.iter().any(|arg| arg.trim().is_empty()) {
      return Err(ConfigError::Invalid("mpvArgs cannot contain empty arguments".into()));
    }
    if matches!(&self.socket_path, Some(path) if path.trim().is_empty()) {
      return Err(ConfigError::Invalid("socketPath cannot be empty".into()));
    }
    Ok(())
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_millis(self.shutdown_grace_ms)
  }

  pub fn launch_options(&self) -> LaunchOptions {
    LaunchOptions {
      extra_args: self.mpv_args.clone(),
      keep_open: self.keep_open,
      output_tail: self.output_tail_lines,
    }
  }
}
