//! Configuration file support for hidboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HIDBOOT_*)
//! 3. Local config file (./hidboot.toml)
//! 4. Global config file (~/.config/hidboot/config.toml)
//!
//! The first two layers are handled by clap; this module covers the files.
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyACM0"
//! baud = 115200
//!
//! [target]
//! board = "rev-b"
//! app_start = 0x4000
//! ack_timeout_ms = 300
//!
//! # Full opcode table for a custom board.
//! [profile]
//! single = 0x10
//! # ...
//! ```

use anyhow::{Result, bail};
use directories::ProjectDirs;
use hidboot::{AddressingMode, BoardRevision, LinkTimeouts, ProtocolProfile, TargetConfig};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::CliError;

/// Name of the per-project configuration file.
pub const LOCAL_CONFIG_FILE: &str = "hidboot.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial bridge to use (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate of the bridge.
    pub baud: Option<u32>,
}

/// Target overrides. Every field left out keeps the board default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSection {
    /// Board revision name (rev-a, rev-b, rev-c).
    pub board: Option<String>,
    /// Application start address.
    pub app_start: Option<u32>,
    /// Last bootloader address.
    pub bootloader_end: Option<u32>,
    /// Program block size in bytes.
    pub block_size: Option<usize>,
    /// Extended address interpretation.
    pub addressing: Option<AddressingMode>,
    /// NACK wait after a regular frame.
    pub ack_timeout_ms: Option<u64>,
    /// NACK wait after the final frame.
    pub final_ack_timeout_ms: Option<u64>,
    /// Wait for a segment answer.
    pub segment_timeout_ms: Option<u64>,
    /// Wait for a mode-switch acknowledgment.
    pub mode_switch_timeout_ms: Option<u64>,
    /// Fixed erase settle.
    pub erase_settle_base_ms: Option<u64>,
    /// Erase settle per started KiB.
    pub erase_settle_per_kib_ms: Option<u64>,
    /// Rewind budget per block.
    pub max_rewinds: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Target overrides.
    #[serde(default)]
    pub target: TargetSection,
    /// Custom opcode table, replacing the board's.
    pub profile: Option<ProtocolProfile>,
}

impl Config {
    /// Load configuration from all available sources.
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
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
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
        ProjectDirs::from("", "", "hidboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Fields set in `other` win.
    pub fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        let mine = &mut self.target;
        let theirs = other.target;
        macro_rules! take {
            ($($field:ident),*) => {
                $(if theirs.$field.is_some() { mine.$field = theirs.$field; })*
            };
        }
        take!(
            board,
            app_start,
            bootloader_end,
            block_size,
            addressing,
            ack_timeout_ms,
            final_ack_timeout_ms,
            segment_timeout_ms,
            mode_switch_timeout_ms,
            erase_settle_base_ms,
            erase_settle_per_kib_ms,
            max_rewinds
        );

        if other.profile.is_some() {
            self.profile = other.profile;
        }
    }

    /// Board named in the file, if any.
    pub fn board(&self) -> Result<Option<BoardRevision>> {
        match self.target.board.as_deref() {
            None => Ok(None),
            Some(name) => match BoardRevision::from_name(name) {
                Some(board) => Ok(Some(board)),
                None => Err(CliError::Usage(format!(
                    "Unknown board '{name}' in configuration (expected rev-a, rev-b or rev-c)"
                ))
                .into()),
            },
        }
    }

    /// Board defaults for `revision` with every file override applied.
    pub fn target_config(&self, revision: BoardRevision) -> Result<TargetConfig> {
        let t = &self.target;
        let mut config = TargetConfig::new(revision);

        let mut layout = config.layout;
        if let Some(app_start) = t.app_start {
            layout.app_start = app_start;
        }
        if let Some(bootloader_end) = t.bootloader_end {
            layout.bootloader_end = bootloader_end;
        }
        if let Some(block_size) = t.block_size {
            layout = layout.with_block_size(block_size);
        }
        if let Some(addressing) = t.addressing {
            layout = layout.with_addressing(addressing);
        }
        config = config.with_layout(layout);

        let ack = t
            .ack_timeout_ms
            .map_or(config.ack_timeout, Duration::from_millis);
        let final_ack = t
            .final_ack_timeout_ms
            .map_or(config.final_ack_timeout, Duration::from_millis);
        config = config.with_ack_timeouts(ack, final_ack);

        let link = LinkTimeouts {
            segment: t
                .segment_timeout_ms
                .map_or(config.link.segment, Duration::from_millis),
            mode_switch: t
                .mode_switch_timeout_ms
                .map_or(config.link.mode_switch, Duration::from_millis),
        };
        config = config.with_link_timeouts(link);

        let base = t
            .erase_settle_base_ms
            .map_or(config.erase_settle_base, Duration::from_millis);
        let per_kib = t
            .erase_settle_per_kib_ms
            .map_or(config.erase_settle_per_kib, Duration::from_millis);
        config = config.with_erase_settle(base, per_kib);

        if let Some(max_rewinds) = t.max_rewinds {
            config = config.with_max_rewinds(max_rewinds);
        }
        if let Some(profile) = self.profile {
            config = config.with_profile(profile);
        }

        if let Err(e) = config.check() {
            bail!(CliError::Usage(format!("Invalid target configuration: {e}")));
        }
        Ok(config)
    }
}
