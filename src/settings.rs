use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{CaptureOptions, InterfaceType};

pub const MIN_SNAP_LEN: i64 = 64;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("specified network interface '{0}' does not exist")]
    UnknownInterface(String),

    #[error("minimum snapshot length is 64, got {0}")]
    SnapLenTooSmall(i64),

    #[error("snapshot length must be an unsigned 32-bit integer, got {0}")]
    SnapLenTooLarge(i64),

    #[error("invalid interface type '{0}'. Must be libpcap or afpacket")]
    InvalidInterfaceType(String),
}

/// Per-analyzer entry under `analyzers:`. A bare key with no value means
/// "enabled".
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AnalyzerEntry {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

// The struct that holds the sensor configuration.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub interface: String,
    pub interface_type: String,
    pub promiscuous: bool,
    pub snap_len: i64,
    pub bpf: String,
    pub log_file: String,
    pub log_level: String,
    pub worker_threads: usize,
    pub flow_timeout_secs: u64,
    /// Payload bytes kept per TCP flow.
    pub max_flow_bytes: usize,
    pub slow_analysis_ms: u64,
    pub update_analyzers: bool,
    pub plugin_dir: Option<String>,
    #[serde(default)]
    pub analyzers: BTreeMap<String, Option<AnalyzerEntry>>,
}

impl Settings {
    /// Loads defaults, then `path`, then `NIDS_*` environment overrides.
    pub fn new(path: &str) -> Result<Self, SettingsError> {
        let builder = Self::defaults()?
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("NIDS"));

        Ok(builder.build()?.try_deserialize()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, SettingsError> {
        Ok(Config::builder()
            .set_default("interface", "")?
            .set_default("interface_type", "libpcap")?
            .set_default("promiscuous", false)?
            .set_default("snap_len", 262144)?
            .set_default("bpf", "")?
            .set_default("log_file", "nids.log")?
            .set_default("log_level", "info")?
            .set_default("worker_threads", 4)?
            .set_default("flow_timeout_secs", 60)?
            .set_default("max_flow_bytes", 10 * 1024 * 1024)?
            .set_default("slow_analysis_ms", 1000)?
            .set_default("update_analyzers", false)?)
    }

    /// References of every analyzer that is not explicitly disabled.
    pub fn enabled_analyzers(&self) -> Vec<&str> {
        self.analyzers
            .iter()
            .filter(|(_, entry)| entry.as_ref().is_none_or(|e| e.enabled))
            .map(|(reference, _)| reference.as_str())
            .collect()
    }

    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.plugin_dir.as_ref().map(PathBuf::from)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout_secs)
    }

    pub fn slow_analysis(&self) -> Duration {
        Duration::from_millis(self.slow_analysis_ms)
    }

    /// Checks the capture settings against the devices present on this host.
    pub fn capture_options(&self, devices: &[String]) -> Result<CaptureOptions, SettingsError> {
        validate_interface(&self.interface, devices)?;
        let snap_len = validate_snapshot_length(self.snap_len)?;
        let interface_type = self.interface_type.parse()?;
        Ok(CaptureOptions {
            interface: self.interface.clone(),
            interface_type,
            promiscuous: self.promiscuous,
            snap_len,
            bpf: self.bpf.clone(),
        })
    }
}

pub fn validate_interface(interface: &str, devices: &[String]) -> Result<(), SettingsError> {
    if devices.iter().any(|d| d == interface) {
        Ok(())
    } else {
        Err(SettingsError::UnknownInterface(interface.to_string()))
    }
}

pub fn validate_snapshot_length(snap_len: i64) -> Result<u32, SettingsError> {
    if snap_len < MIN_SNAP_LEN {
        return Err(SettingsError::SnapLenTooSmall(snap_len));
    }
    u32::try_from(snap_len).map_err(|_| SettingsError::SnapLenTooLarge(snap_len))
}

impl FromStr for InterfaceType {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libpcap" => Ok(InterfaceType::Libpcap),
            "afpacket" => Ok(InterfaceType::Afpacket),
            other => Err(SettingsError::InvalidInterfaceType(other.to_string())),
        }
    }
}
