//! Configuration system for the CHDR transport.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CHDR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/chdr/config.toml
//!   3. ~/.config/chdr/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::chdr::{ChdrCodec, ChdrError, ChdrWidth, Endianness};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChdrConfig {
    pub device: DeviceConfig,
    pub codec: CodecConfig,
    pub link: LinkConfig,
    pub mtu: MtuConfig,
    pub flow_control: FlowControlConfig,
    pub claim: ClaimConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Dma,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    /// Device IP address (udp). Empty = discover.
    pub addr: String,
    /// Broadcast address used for discovery.
    pub broadcast_addr: String,
    /// DMA resource name (dma).
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// CHDR word width in bits: 64, 128, 256 or 512.
    pub width_bits: usize,
    /// "big" or "little".
    pub endianness: String,
}

/// Optional user hints for frame-size negotiation. `None` = use the
/// transport's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub recv_frame_size: Option<usize>,
    pub send_frame_size: Option<usize>,
    pub num_recv_frames: Option<usize>,
    pub num_send_frames: Option<usize>,
    pub recv_buff_size: Option<usize>,
    pub send_buff_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtuFallbackConfig {
    Fail,
    UseDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtuConfig {
    /// Measure the path MTU before opening data links.
    pub probe: bool,
    pub echo_timeout_ms: u64,
    /// What to do when the device does not answer the probe.
    pub fallback: MtuFallbackConfig,
    /// Frame size used by `use_default`.
    pub default_frame_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlUnitsConfig {
    Bytes,
    Packets,
    BytesAndPackets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub units: FlowControlUnitsConfig,
    /// Fraction of capacity after which the receiver reports.
    pub freq_ratio: f64,
    /// Fraction of capacity kept back as feedback headroom.
    pub headroom_ratio: f64,
    pub init_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Claim the device on open.
    pub enabled: bool,
    pub timeout_ms: u64,
    pub heartbeat_ms: u64,
    /// Break a claim whose record has not changed for this long. 0 = never.
    pub stale_after_ms: u64,
    pub takeover_stale: bool,
    /// Keep going without a claim when another process holds the device.
    pub allow_unclaimed: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            addr: String::new(),
            broadcast_addr: "255.255.255.255".to_string(),
            resource: "RIO0".to_string(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            width_bits: 64,
            endianness: "big".to_string(),
        }
    }
}

impl Default for MtuConfig {
    fn default() -> Self {
        Self {
            probe: true,
            echo_timeout_ms: 20,
            fallback: MtuFallbackConfig::UseDefault,
            default_frame_size: 1472,
        }
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            units: FlowControlUnitsConfig::Bytes,
            freq_ratio: 0.125,
            headroom_ratio: 0.0625,
            init_timeout_ms: 200,
        }
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 1000,
            heartbeat_ms: 1000,
            stale_after_ms: 3000,
            takeover_stale: false,
            allow_unclaimed: false,
        }
    }
}

impl CodecConfig {
    /// Build the session codec described by this section.
    pub fn codec(&self) -> Result<ChdrCodec, ChdrError> {
        let width = ChdrWidth::from_bits(self.width_bits)?;
        let endianness = match self.endianness.to_ascii_lowercase().as_str() {
            "little" | "le" => Endianness::Little,
            _ => Endianness::Big,
        };
        Ok(ChdrCodec::new(width, endianness))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("chdr")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ChdrConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            ChdrConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CHDR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ChdrConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CHDR_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("CHDR_DEVICE__TRANSPORT") {
            match v.to_ascii_lowercase().as_str() {
                "udp" => self.device.transport = TransportKind::Udp,
                "dma" => self.device.transport = TransportKind::Dma,
                _ => {}
            }
        }
        if let Some(v) = var("CHDR_DEVICE__ADDR") {
            self.device.addr = v;
        }
        if let Some(v) = var("CHDR_DEVICE__BROADCAST_ADDR") {
            self.device.broadcast_addr = v;
        }
        if let Some(v) = var("CHDR_DEVICE__RESOURCE") {
            self.device.resource = v;
        }
        if let Some(v) = var("CHDR_CODEC__WIDTH_BITS").and_then(|v| v.parse().ok()) {
            self.codec.width_bits = v;
        }
        if let Some(v) = var("CHDR_CODEC__ENDIANNESS") {
            self.codec.endianness = v;
        }

        let sizes = [
            ("CHDR_LINK__RECV_FRAME_SIZE", &mut self.link.recv_frame_size),
            ("CHDR_LINK__SEND_FRAME_SIZE", &mut self.link.send_frame_size),
            ("CHDR_LINK__NUM_RECV_FRAMES", &mut self.link.num_recv_frames),
            ("CHDR_LINK__NUM_SEND_FRAMES", &mut self.link.num_send_frames),
            ("CHDR_LINK__RECV_BUFF_SIZE", &mut self.link.recv_buff_size),
            ("CHDR_LINK__SEND_BUFF_SIZE", &mut self.link.send_buff_size),
        ];
        for (key, slot) in sizes {
            if let Some(v) = var(key).and_then(|v| v.parse().ok()) {
                *slot = Some(v);
            }
        }

        if let Some(v) = var("CHDR_MTU__PROBE") {
            self.mtu.probe = flag(v);
        }
        if let Some(v) = var("CHDR_MTU__ECHO_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.mtu.echo_timeout_ms = v;
        }
        if let Some(v) = var("CHDR_MTU__FALLBACK") {
            match v.to_ascii_lowercase().as_str() {
                "fail" => self.mtu.fallback = MtuFallbackConfig::Fail,
                "use_default" => self.mtu.fallback = MtuFallbackConfig::UseDefault,
                _ => {}
            }
        }
        if let Some(v) = var("CHDR_MTU__DEFAULT_FRAME_SIZE").and_then(|v| v.parse().ok()) {
            self.mtu.default_frame_size = v;
        }
        if let Some(v) = var("CHDR_FLOW_CONTROL__UNITS") {
            match v.to_ascii_lowercase().as_str() {
                "bytes" => self.flow_control.units = FlowControlUnitsConfig::Bytes,
                "packets" => self.flow_control.units = FlowControlUnitsConfig::Packets,
                "bytes_and_packets" => self.flow_control.units = FlowControlUnitsConfig::BytesAndPackets,
                _ => {}
            }
        }
        if let Some(v) = var("CHDR_FLOW_CONTROL__FREQ_RATIO").and_then(|v| v.parse().ok()) {
            self.flow_control.freq_ratio = v;
        }
        if let Some(v) = var("CHDR_FLOW_CONTROL__HEADROOM_RATIO").and_then(|v| v.parse().ok()) {
            self.flow_control.headroom_ratio = v;
        }
        if let Some(v) = var("CHDR_FLOW_CONTROL__INIT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.flow_control.init_timeout_ms = v;
        }
        if let Some(v) = var("CHDR_CLAIM__ENABLED") {
            self.claim.enabled = flag(v);
        }
        if let Some(v) = var("CHDR_CLAIM__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.claim.timeout_ms = v;
        }
        if let Some(v) = var("CHDR_CLAIM__HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.claim.heartbeat_ms = v;
        }
        if let Some(v) = var("CHDR_CLAIM__STALE_AFTER_MS").and_then(|v| v.parse().ok()) {
            self.claim.stale_after_ms = v;
        }
        if let Some(v) = var("CHDR_CLAIM__TAKEOVER_STALE") {
            self.claim.takeover_stale = flag(v);
        }
        if let Some(v) = var("CHDR_CLAIM__ALLOW_UNCLAIMED") {
            self.claim.allow_unclaimed = flag(v);
        }
    }
}
