//! Configuration file support for smsprog.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SMSPROG_*)
//! 3. Local config file (./smsprog.toml)
//! 4. Global config file (~/.config/smsprog/config.toml)
//!
//! An explicit `--config PATH` replaces sources 3 and 4.

use {
    anyhow::{Context, Result},
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    smsprog::UploadHandshake,
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "smsprog.toml";

/// Port used when nothing else names one.
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Serial port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
}

/// Bulk transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload handshake, "nak" or "ready".
    pub upload_handshake: Option<String>,
}

/// Firmware update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Flashing tool executable.
    pub tool: Option<String>,
    /// Device id passed to the tool.
    pub device: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Firmware update configuration.
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit files, an explicit file must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from an implicit file, skipping it on any problem.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "smsprog").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.transfer.upload_handshake.is_some() {
            self.transfer.upload_handshake = other.transfer.upload_handshake;
        }
        if other.firmware.tool.is_some() {
            self.firmware.tool = other.firmware.tool;
        }
        if other.firmware.device.is_some() {
            self.firmware.device = other.firmware.device;
        }
    }

    /// Serial port, falling back to the built-in default.
    pub fn serial_port(&self) -> &str {
        self.port
            .serial
            .as_deref()
            .unwrap_or(DEFAULT_PORT)
    }

    /// Configured upload handshake, if any.
    pub fn upload_handshake(&self) -> Result<Option<UploadHandshake>> {
        self.transfer
            .upload_handshake
            .as_deref()
            .map(|value| {
                value
                    .parse()
                    .with_context(|| format!("Invalid [transfer] upload_handshake '{value}'"))
            })
            .transpose()
    }
}
