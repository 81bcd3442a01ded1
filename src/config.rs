use crate::error::{AhmError, Result};
use crate::protocol::DEFAULT_PORT;
use crate::types::{ChannelId, ChannelKind, CrosspointId, DeviceModel, SourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_initial_wait_ms() -> u64 {
    1000
}

/// Everything needed to talk to one device
///
/// Channel lists hold 1-based indices. Send maps are keyed by destination
/// zone and list the source indices routed into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub model: DeviceModel,
    #[serde(default)]
    pub inputs: Vec<u8>,
    #[serde(default)]
    pub zones: Vec<u8>,
    #[serde(default)]
    pub control_groups: Vec<u8>,
    #[serde(default)]
    pub rooms: Vec<u8>,
    #[serde(default)]
    pub input_to_zone_sends: BTreeMap<u8, Vec<u8>>,
    #[serde(default)]
    pub zone_to_zone_sends: BTreeMap<u8, Vec<u8>>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,
}

impl DeviceConfig {
    /// Config with defaults and nothing tracked
    pub fn new(host: impl Into<String>, model: DeviceModel) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            model,
            inputs: Vec::new(),
            zones: Vec::new(),
            control_groups: Vec::new(),
            rooms: Vec::new(),
            input_to_zone_sends: BTreeMap::new(),
            zone_to_zone_sends: BTreeMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_wait_ms: default_initial_wait_ms(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Check every configured index against the model's bounds
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AhmError::invalid("host must not be empty"));
        }
        if self.request_timeout_ms == 0 || self.poll_interval_secs == 0 {
            return Err(AhmError::invalid(
                "request timeout and poll interval must be non-zero",
            ));
        }
        let limits = self.model.limits();
        for channel in self.channels() {
            limits.check(channel)?;
        }
        for crosspoint in self.crosspoints() {
            limits.check_crosspoint(crosspoint)?;
        }
        Ok(())
    }

    /// Every configured channel, in kind order
    pub fn channels(&self) -> Vec<ChannelId> {
        let lists = [
            (ChannelKind::Input, &self.inputs),
            (ChannelKind::Zone, &self.zones),
            (ChannelKind::ControlGroup, &self.control_groups),
            (ChannelKind::Room, &self.rooms),
        ];
        lists
            .into_iter()
            .flat_map(|(kind, indices)| indices.iter().map(move |&i| ChannelId::new(kind, i)))
            .collect()
    }

    /// Every configured crosspoint
    pub fn crosspoints(&self) -> Vec<CrosspointId> {
        let maps = [
            (SourceKind::Input, &self.input_to_zone_sends),
            (SourceKind::Zone, &self.zone_to_zone_sends),
        ];
        maps.into_iter()
            .flat_map(|(source, sends)| {
                sends.iter().flat_map(move |(&dest, sources)| {
                    sources
                        .iter()
                        .map(move |&index| CrosspointId::new(source, index, dest))
                })
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }
}
