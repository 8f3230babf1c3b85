//! Call session configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunables for one call session. Every field has a default matching the
/// production issuing path; a TOML file can override any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Maximum accepted invitation-link age, in seconds.
    pub link_ttl_secs: u64,
    /// Frame sampling loop period, in milliseconds.
    pub sample_interval_ms: u64,
    /// Minimum wall-clock spacing between published frames, in milliseconds.
    pub min_send_interval_ms: u64,
    /// Outbound frame width after downscaling.
    pub frame_width: u32,
    /// Outbound frame height after downscaling.
    pub frame_height: u32,
    /// JPEG quality factor (0-100).
    pub jpeg_quality: u8,
    /// Burn a role-colored badge into outbound frames.
    pub debug_overlay: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            link_ttl_secs: 2 * 60 * 60,
            sample_interval_ms: 100,
            min_send_interval_ms: 500,
            frame_width: 240,
            frame_height: 180,
            jpeg_quality: 70,
            debug_overlay: false,
        }
    }
}

impl CallConfig {
    /// Load configuration from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn link_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.link_ttl_secs as i64)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }
}
