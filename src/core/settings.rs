//! Application settings management

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::process::TerminationWatch;
use crate::error::{InstanceError, Result};

/// Settings file name inside the data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Default prefix for launcher bundle identifiers
pub const DEFAULT_BUNDLE_PREFIX: &str = "com.multiinstance.instance";

/// How termination of launched instances is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum WatchMode {
    /// Wait on the process handle
    #[default]
    Wait,
    /// Check liveness every `poll_interval_ms`
    Poll,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Where launcher bundles are written
    pub shims_directory: Option<PathBuf>,
    /// Home directory shared locations link back to
    pub real_home: Option<PathBuf>,
    /// Launch through the generated launcher bundle instead of the binary
    pub use_shims: bool,
    /// Ad-hoc sign launcher bundles
    pub sign_shims: bool,
    /// Register launcher bundles with the OS shell
    pub register_shims: bool,
    /// Prefix for launcher bundle identifiers
    pub bundle_prefix: String,
    pub watch_mode: WatchMode,
    /// Liveness poll interval in ms
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_directory: None,
            shims_directory: None,
            real_home: None,
            use_shims: true,
            sign_shims: cfg!(target_os = "macos"),
            register_shims: cfg!(target_os = "macos"),
            bundle_prefix: DEFAULT_BUNDLE_PREFIX.to_string(),
            watch_mode: WatchMode::Wait,
            poll_interval_ms: 1000,
        }
    }
}

impl Settings {
    /// Load settings from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Settings = match std::fs::read_to_string(path) {
            Ok(json) => Self::parse(&json).map_err(|e| {
                InstanceError::Format(format!("Invalid settings {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {:?}, using defaults", path);
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.validate();
        Ok(settings)
    }

    /// Parse a settings document; anything but a JSON object is rejected
    fn parse(json: &str) -> std::result::Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
        if !value.is_object() {
            return Err("expected a JSON object".to_string());
        }
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    /// Load `settings.json` from a data directory, keeping that directory.
    pub fn load_from_dir(data_dir: &Path) -> Result<Self> {
        let mut settings = Self::load(&data_dir.join(SETTINGS_FILE))?;
        settings.data_directory = Some(data_dir.to_path_buf());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Settings saved to {:?}", path);
        Ok(())
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("MultiInstance")
        })
    }

    /// Get the instances data directory
    pub fn get_instances_directory(&self) -> PathBuf {
        self.get_data_directory().join("instances")
    }

    /// Get the launcher bundle directory
    pub fn get_shims_directory(&self) -> PathBuf {
        self.shims_directory.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join("Applications").join("MultiInstance"))
                .unwrap_or_else(|| self.get_data_directory().join("shims"))
        })
    }

    /// Get the store document path
    pub fn get_store_path(&self) -> PathBuf {
        self.get_data_directory().join("instances.json")
    }

    pub fn get_real_home(&self) -> PathBuf {
        self.real_home
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn termination_watch(&self) -> TerminationWatch {
        match self.watch_mode {
            WatchMode::Wait => TerminationWatch::Wait,
            WatchMode::Poll => TerminationWatch::Poll(self.poll_interval()),
        }
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 60_000);
        if self.bundle_prefix.trim().is_empty() {
            self.bundle_prefix = DEFAULT_BUNDLE_PREFIX.to_string();
        }
        self.bundle_prefix = self.bundle_prefix.trim_end_matches('.').to_string();
    }
}
