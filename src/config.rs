//! Session configuration loading.
//!
//! Mirrors the teacher crate's `control::config::ControlConfig::load`: a thin
//! `serde` + `toml` layer over a plain data struct, with `anyhow::Context`
//! wrapping the file-I/O boundary.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// Numeric firmware version below which [`crate::error::CoreError::FirmwareTooOld`]
/// is logged. Chosen to match the lowest 2.x firmware this core has been
/// validated against; override via [`SessionConfig`] for other fleets.
pub const DEFAULT_MINIMUM_FIRMWARE_VERSION: u32 = 20300;

/// Default bound on the transmit queue's live (non-terminal) entries.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default bound on XMODEM block retransmissions before giving up with `CAN`.
pub const DEFAULT_XMODEM_MAX_RETRIES: u8 = 5;

/// Tuning knobs for a [`crate::session::DeviceSession`].
///
/// `lockstep_id` is normally left `None` so the session draws it from a CSPRNG
/// at construction time; set it explicitly for deterministic tests (§6 of the
/// spec this crate implements).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    #[serde(default)]
    pub lockstep_id: Option<u32>,
    #[serde(default = "default_minimum_firmware_version")]
    pub minimum_firmware_version: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_xmodem_max_retries")]
    pub xmodem_max_retries: u8,
}

fn default_minimum_firmware_version() -> u32 {
    DEFAULT_MINIMUM_FIRMWARE_VERSION
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_xmodem_max_retries() -> u8 {
    DEFAULT_XMODEM_MAX_RETRIES
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lockstep_id: None,
            minimum_firmware_version: DEFAULT_MINIMUM_FIRMWARE_VERSION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            xmodem_max_retries: DEFAULT_XMODEM_MAX_RETRIES,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to [`Default`] for
    /// any field the file omits.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read session config file: {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse session config file: {}", config_path.display()))
    }
}
