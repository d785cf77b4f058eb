//! Driver configuration management
//!
//! These are the knobs the kernel module exposed as load-time parameters, plus
//! a few policy switches. Values are read once; a device picks them up when it
//! is probed.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    /// Handling of transient inbound transfer errors
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Read ring buffer size in reports
    #[serde(default = "DriverSettings::default_ring_buffer_size")]
    pub ring_buffer_size: usize,
    /// Write buffer size in bytes; writes carry at most this many whole frames
    #[serde(default = "DriverSettings::default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Minimum interrupt in interval in ms
    #[serde(default = "DriverSettings::default_interval_ms")]
    pub min_interrupt_in_interval_ms: u64,
    /// Minimum interrupt out interval in ms
    #[serde(default = "DriverSettings::default_interval_ms")]
    pub min_interrupt_out_interval_ms: u64,
    /// Log every report and command
    #[serde(default)]
    pub debug: bool,
    /// Initial value of the `compress_wheel` attribute at open
    #[serde(default = "default_true")]
    pub compress_wheel: bool,
    /// Queue only the first of a run of offline reports
    #[serde(default = "default_true")]
    pub suppress_extra_offline_events: bool,
    /// Refuse a second concurrent open
    #[serde(default)]
    pub exclusive_open: bool,
    /// Start polling at probe instead of first open
    #[serde(default)]
    pub auto_start: bool,
    /// How long the last close waits for an outstanding write
    #[serde(default = "DriverSettings::default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            ring_buffer_size: Self::default_ring_buffer_size(),
            write_buffer_size: Self::default_write_buffer_size(),
            min_interrupt_in_interval_ms: Self::default_interval_ms(),
            min_interrupt_out_interval_ms: Self::default_interval_ms(),
            debug: false,
            compress_wheel: true,
            suppress_extra_offline_events: true,
            exclusive_open: false,
            auto_start: false,
            release_timeout_ms: Self::default_release_timeout_ms(),
        }
    }
}

impl DriverSettings {
    fn default_ring_buffer_size() -> usize {
        1000
    }

    fn default_write_buffer_size() -> usize {
        34
    }

    fn default_interval_ms() -> u64 {
        10
    }

    fn default_release_timeout_ms() -> u64 {
        2000
    }

    pub fn min_in_interval(&self) -> Duration {
        Duration::from_millis(self.min_interrupt_in_interval_ms)
    }

    pub fn min_out_interval(&self) -> Duration {
        Duration::from_millis(self.min_interrupt_out_interval_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

/// Transient error policy
///
/// The defaults resubmit immediately and forever. Setting a bound makes the
/// driver give up on the inbound loop after that many consecutive failures.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrySettings {
    /// Consecutive transient errors tolerated before polling stops (None = unbounded)
    #[serde(default)]
    pub max_consecutive_transient_errors: Option<u32>,
    /// Delay before resubmitting after a transient error
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetrySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to bind, as "0xVID:0xPID" (PID may be "*")
    #[serde(default = "UsbSettings::default_filter")]
    pub device_filter: String,
    /// Watch for hot-plug arrivals and removals
    #[serde(default = "default_true")]
    pub hotplug: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            device_filter: Self::default_filter(),
            hotplug: true,
        }
    }
}

impl UsbSettings {
    fn default_filter() -> String {
        format!("{:#06x}:{:#06x}", protocol::VENDOR_ID, protocol::PRODUCT_ID)
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/tranzport/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tranzport").join("driver.toml")
        } else {
            PathBuf::from(".config/tranzport/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.ring_buffer_size == 0 {
            return Err(anyhow!("ring_buffer_size must be at least 1"));
        }

        if self.driver.write_buffer_size < protocol::FRAME_SIZE {
            return Err(anyhow!(
                "write_buffer_size must hold at least one {}-byte frame, got {}",
                protocol::FRAME_SIZE,
                self.driver.write_buffer_size
            ));
        }

        if self.retry.max_consecutive_transient_errors == Some(0) {
            return Err(anyhow!(
                "max_consecutive_transient_errors must be at least 1 when set"
            ));
        }

        Self::validate_filter(&self.usb.device_filter)?;

        Ok(())
    }

    /// The (vendor, product) pair the filter selects; product None matches any
    pub fn device_match(&self) -> Result<(u16, Option<u16>)> {
        Self::validate_filter(&self.usb.device_filter)?;
        let (vid, pid) = self
            .usb
            .device_filter
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid filter '{}'", self.usb.device_filter))?;
        let vendor = Self::parse_hex_id(vid)?;
        let product = if pid == "*" {
            None
        } else {
            Some(Self::parse_hex_id(pid)?)
        };
        Ok((vendor, product))
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x165b:0x8101' or '0x165b:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        // The vendor must always be pinned
        Self::validate_hex_id(vid, "VID")?;

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x165b')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    fn parse_hex_id(id: &str) -> Result<u16> {
        u16::from_str_radix(&id[2..], 16).map_err(|e| anyhow!("Invalid hex id '{}': {}", id, e))
    }
}

/// Load a config from a path that may start with `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
