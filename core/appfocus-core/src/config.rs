//! Application handle, monitor configuration, and derived paths.
//!
//! Everything the processes of one app share lives under a single data
//! directory (default `~/.appfocus/<app_id>`):
//!
//! ```text
//! <data_dir>/
//!   appfocus.toml       optional MonitorConfig
//!   lock/process.lock   ProcessMutex file
//!   state.json          shared foreground/paused flags
//!   bus/                subscriber sockets
//!   logs/               rolling log files (log_to_file = true)
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FocusError, Result};

pub const CONFIG_FILE_NAME: &str = "appfocus.toml";
pub const LOCK_TIMEOUT_ENV: &str = "APPFOCUS_LOCK_TIMEOUT_MS";
pub const TRANSPORT_ENV: &str = "APPFOCUS_TRANSPORT";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Identifies the application whose processes coordinate with each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppHandle {
    pub app_id: String,
    pub data_dir: PathBuf,
    /// Name this process reports; `None` resolves it from the environment
    /// or the OS process table.
    pub process_name: Option<String>,
}

impl AppHandle {
    /// Handle rooted at `~/.appfocus/<app_id>`.
    pub fn new(app_id: impl Into<String>) -> Result<Self> {
        let app_id = app_id.into();
        let home = dirs::home_dir().ok_or(FocusError::HomeDirNotFound)?;
        let data_dir = home.join(".appfocus").join(&app_id);
        Ok(Self::with_data_dir(app_id, data_dir))
    }

    pub fn with_data_dir(app_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_id: app_id.into(),
            data_dir: data_dir.into(),
            process_name: None,
        }
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("lock").join("process.lock")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn bus_dir(&self) -> PathBuf {
        self.data_dir.join("bus")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Unix domain sockets under `<data_dir>/bus/`; reaches other processes.
    #[default]
    Socket,
    /// In-process channels only.
    Local,
}

impl Transport {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "socket" => Some(Transport::Socket),
            "local" => Some(Transport::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub transport: Transport,
    pub log_to_file: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            transport: Transport::default(),
            log_to_file: false,
        }
    }
}

impl MonitorConfig {
    /// Reads `<data_dir>/appfocus.toml` (defaults when absent), then applies
    /// environment overrides.
    pub fn load(app: &AppHandle) -> Result<Self> {
        let mut config = Self::load_file(&app.config_path())?;
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs_err::read_to_string(path).map_err(|err| FocusError::ConfigMalformed {
                path: path.to_path_buf(),
                details: format!("unreadable: {}", err),
            })?;
        toml::from_str(&content).map_err(|err| FocusError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    /// Unparseable override values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(LOCK_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.lock_timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {}", LOCK_TIMEOUT_ENV),
            }
        }
        if let Some(raw) = lookup(TRANSPORT_ENV) {
            match Transport::parse(&raw) {
                Some(transport) => self.transport = transport,
                None => tracing::warn!(value = %raw, "Ignoring invalid {}", TRANSPORT_ENV),
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
