//! Configuration system for cxlsim.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CXLSIM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cxlsim/config.toml
//!   3. ~/.config/cxlsim/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::codec::FlitLayout;
use crate::packet::{DeviceId, VhId};
use crate::wire::{ProtocolKind, WireError, DEFAULT_SLOTS_PER_FLIT, DEFAULT_SLOT_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub link: LinkSettings,
    pub transaction: TransactionSettings,
    pub topology: Topology,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Slots per flit, 1..=16.
    pub slots_per_flit: usize,
    /// Payload bytes per slot. Must fit a packet header plus a cache line
    /// (84 bytes); smaller values are rejected when the topology is built.
    pub slot_payload_size: usize,
    /// Order in which pending packets claim slots when a flit is packed.
    /// Kinds left out are appended in io, cache, mem order.
    pub priority: Vec<ProtocolKind>,
    /// Default receive-buffer credits advertised on every link.
    pub credits: Credits,
}

/// Credit capacity per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credits {
    pub io: u16,
    pub cache: u16,
    pub mem: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Deadline for a response, counted from issue.
    pub timeout_ms: u64,
    /// How long a timed-out id stays unusable. 0 = 4 × timeout.
    pub quarantine_ms: u64,
    /// Max open transaction ids per state machine.
    pub window: usize,
    /// Endpoint housekeeping period. Deadlines wake an endpoint on their own.
    pub poll_interval_ms: u64,
}

/// Hosts, devices, and switches, and what each one is plugged into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub hosts: Vec<EndpointSpec>,
    pub devices: Vec<EndpointSpec>,
    pub switches: Vec<SwitchSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: DeviceId,
    #[serde(default)]
    pub vh: VhId,
    pub attach: Attach,
    /// Overrides `link.credits` for this endpoint's link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<Credits>,
}

/// Where an endpoint's link terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attach {
    Switch { switch: u16, port: u16 },
    Endpoint { endpoint: DeviceId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub id: u16,
    pub ports: Vec<PortSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub vh: VhId,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            transaction: TransactionSettings::default(),
            topology: Topology::demo(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            slots_per_flit: DEFAULT_SLOTS_PER_FLIT,
            slot_payload_size: DEFAULT_SLOT_PAYLOAD,
            priority: vec![ProtocolKind::Cache, ProtocolKind::Mem, ProtocolKind::Io],
            credits: Credits::default(),
        }
    }
}

impl Default for Credits {
    fn default() -> Self {
        Self {
            io: 8,
            cache: 8,
            mem: 8,
        }
    }
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            quarantine_ms: 0,
            window: 4096,
            poll_interval_ms: 1,
        }
    }
}

impl Topology {
    /// One host and two devices behind a single switch, all in hierarchy 0.
    pub fn demo() -> Self {
        Self {
            hosts: vec![EndpointSpec {
                id: 1,
                vh: 0,
                attach: Attach::Switch { switch: 0, port: 0 },
                credits: None,
            }],
            devices: vec![
                EndpointSpec {
                    id: 16,
                    vh: 0,
                    attach: Attach::Switch { switch: 0, port: 1 },
                    credits: None,
                },
                EndpointSpec {
                    id: 17,
                    vh: 0,
                    attach: Attach::Switch { switch: 0, port: 2 },
                    credits: None,
                },
            ],
            switches: vec![SwitchSpec {
                id: 0,
                ports: (0..3).map(|port| PortSpec { port, vh: 0 }).collect(),
            }],
        }
    }
}

impl Credits {
    pub fn get(&self, kind: ProtocolKind) -> u16 {
        match kind {
            ProtocolKind::Io => self.io,
            ProtocolKind::Cache => self.cache,
            ProtocolKind::Mem => self.mem,
        }
    }

    pub fn set(&mut self, kind: ProtocolKind, value: u16) {
        match kind {
            ProtocolKind::Io => self.io = value,
            ProtocolKind::Cache => self.cache = value,
            ProtocolKind::Mem => self.mem = value,
        }
    }
}

impl LinkSettings {
    pub fn layout(&self) -> Result<FlitLayout, WireError> {
        FlitLayout::new(self.slots_per_flit, self.slot_payload_size)
    }

    /// Full slot claim order: configured kinds first, then any left out.
    pub fn priority_order(&self) -> Vec<ProtocolKind> {
        let mut order: Vec<ProtocolKind> = Vec::with_capacity(ProtocolKind::ALL.len());
        for kind in self.priority.iter().chain(ProtocolKind::ALL.iter()) {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }
        order
    }
}

impl TransactionSettings {
    pub fn quarantine_ms(&self) -> u64 {
        if self.quarantine_ms == 0 {
            self.timeout_ms.saturating_mul(4)
        } else {
            self.quarantine_ms
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cxlsim")
}

fn dirs_or_home() -> PathBuf {
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

impl SimConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            SimConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file, without env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CXLSIM_CONFIG")
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
            let text = toml::to_string_pretty(&SimConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CXLSIM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CXLSIM_LINK__SLOTS_PER_FLIT").and_then(|v| v.parse().ok()) {
            self.link.slots_per_flit = v;
        }
        if let Some(v) = var("CXLSIM_LINK__SLOT_PAYLOAD_SIZE").and_then(|v| v.parse().ok()) {
            self.link.slot_payload_size = v;
        }
        if let Some(v) = var("CXLSIM_TRANSACTION__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transaction.timeout_ms = v;
        }
        for kind in ProtocolKind::ALL {
            let key = format!("CXLSIM_LINK__CREDITS__{}", kind.name().to_uppercase());
            if let Some(v) = var(&key).and_then(|v| v.parse().ok()) {
                self.link.credits.set(kind, v);
            }
        }
    }
}
