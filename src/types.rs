use crate::error::{AhmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw MIDI level value (0-127) as carried on the wire
pub type Level = u8;

/// Highest raw level value
pub const MAX_LEVEL: Level = 0x7F;

/// Highest recallable preset number
pub const MAX_PRESET: u16 = 500;

/// Highest playback track number (1-based)
pub const MAX_TRACK: u8 = 128;

/// Kind of channel addressed by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Input,
    Zone,
    ControlGroup,
    Room,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Input,
        ChannelKind::Zone,
        ChannelKind::ControlGroup,
        ChannelKind::Room,
    ];

    /// MIDI channel (the `N` nibble) this kind is addressed on
    pub fn midi_channel(self) -> u8 {
        match self {
            ChannelKind::Input => 0,
            ChannelKind::Zone => 1,
            ChannelKind::ControlGroup => 2,
            ChannelKind::Room => 3,
        }
    }

    /// Kind addressed on MIDI channel `n`, if any
    pub fn from_midi_channel(n: u8) -> Option<Self> {
        match n {
            0 => Some(ChannelKind::Input),
            1 => Some(ChannelKind::Zone),
            2 => Some(ChannelKind::ControlGroup),
            3 => Some(ChannelKind::Room),
            _ => None,
        }
    }

    /// Prefix used in persisted channel keys
    pub fn key_prefix(self) -> &'static str {
        match self {
            ChannelKind::Input => "input",
            ChannelKind::Zone => "zone",
            ChannelKind::ControlGroup => "control_group",
            ChannelKind::Room => "room",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelKind::Input => "Input",
            ChannelKind::Zone => "Zone",
            ChannelKind::ControlGroup => "Control Group",
            ChannelKind::Room => "Room",
        };
        f.write_str(label)
    }
}

/// Identity of a channel: kind plus 1-based index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    pub kind: ChannelKind,
    pub index: u8,
}

impl ChannelId {
    /// Channel of `kind` with a 1-based `index`
    pub fn new(kind: ChannelKind, index: u8) -> Self {
        Self { kind, index }
    }

    /// Input channel, 1-based
    pub fn input(index: u8) -> Self {
        Self::new(ChannelKind::Input, index)
    }

    /// Zone, 1-based
    pub fn zone(index: u8) -> Self {
        Self::new(ChannelKind::Zone, index)
    }

    /// Control group, 1-based
    pub fn control_group(index: u8) -> Self {
        Self::new(ChannelKind::ControlGroup, index)
    }

    /// Room, 1-based
    pub fn room(index: u8) -> Self {
        Self::new(ChannelKind::Room, index)
    }

    /// Stable key such as `input_3`, used by the name store
    pub fn key(&self) -> String {
        format!("{}_{}", self.kind.key_prefix(), self.index)
    }

    /// Parse a key produced by [`ChannelId::key`]
    pub fn parse_key(key: &str) -> Option<Self> {
        let (prefix, index) = key.rsplit_once('_')?;
        let index: u8 = index.parse().ok()?;
        let kind = ChannelKind::ALL
            .into_iter()
            .find(|kind| kind.key_prefix() == prefix)?;
        Some(Self::new(kind, index))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.index)
    }
}

/// Source side of a crosspoint send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Input,
    Zone,
}

impl SourceKind {
    /// Channel kind of the source
    pub fn channel_kind(self) -> ChannelKind {
        match self {
            SourceKind::Input => ChannelKind::Input,
            SourceKind::Zone => ChannelKind::Zone,
        }
    }

    /// Source addressed on MIDI channel `n`; only inputs and zones send
    pub fn from_midi_channel(n: u8) -> Option<Self> {
        match n {
            0 => Some(SourceKind::Input),
            1 => Some(SourceKind::Zone),
            _ => None,
        }
    }
}

/// Identity of a crosspoint: source channel routed into a destination zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrosspointId {
    pub source: SourceKind,
    pub source_index: u8,
    pub dest_zone: u8,
}

impl CrosspointId {
    /// Route from a source channel into zone `dest_zone`
    pub fn new(source: SourceKind, source_index: u8, dest_zone: u8) -> Self {
        Self {
            source,
            source_index,
            dest_zone,
        }
    }

    /// The channel on the source side of this send
    pub fn source_channel(&self) -> ChannelId {
        ChannelId::new(self.source.channel_kind(), self.source_index)
    }

    /// Key such as `input_1_to_zone_2`
    pub fn key(&self) -> String {
        format!("{}_to_zone_{}", self.source_channel().key(), self.dest_zone)
    }
}

impl fmt::Display for CrosspointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> Zone {}", self.source_channel(), self.dest_zone)
    }
}

/// AHM hardware variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceModel {
    #[default]
    #[serde(rename = "AHM-16")]
    Ahm16,
    #[serde(rename = "AHM-32")]
    Ahm32,
    #[serde(rename = "AHM-64")]
    Ahm64,
}

impl DeviceModel {
    /// Channel and preset bounds for this model
    pub fn limits(self) -> ModelLimits {
        match self {
            DeviceModel::Ahm16 => ModelLimits::new(16, 16),
            DeviceModel::Ahm32 => ModelLimits::new(32, 32),
            DeviceModel::Ahm64 => ModelLimits::new(64, 64),
        }
    }
}

/// Per-model channel bounds, passed into address lookups and validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub inputs: u8,
    pub zones: u8,
    pub control_groups: u8,
    pub rooms: u8,
}

impl ModelLimits {
    fn new(inputs: u8, zones: u8) -> Self {
        Self {
            inputs,
            zones,
            control_groups: 32,
            rooms: 16,
        }
    }

    /// Highest valid 1-based index for `kind`
    pub fn bound(&self, kind: ChannelKind) -> u8 {
        match kind {
            ChannelKind::Input => self.inputs,
            ChannelKind::Zone => self.zones,
            ChannelKind::ControlGroup => self.control_groups,
            ChannelKind::Room => self.rooms,
        }
    }

    /// Reject a channel this model does not have
    pub fn check(&self, channel: ChannelId) -> Result<()> {
        let bound = self.bound(channel.kind);
        if channel.index == 0 || channel.index > bound {
            return Err(AhmError::invalid(format!(
                "{} out of range (1..={})",
                channel, bound
            )));
        }
        Ok(())
    }

    /// Reject a crosspoint whose source or zone this model does not have
    pub fn check_crosspoint(&self, crosspoint: CrosspointId) -> Result<()> {
        self.check(crosspoint.source_channel())?;
        self.check(ChannelId::zone(crosspoint.dest_zone))
    }

    /// Every channel of `kind` within bounds
    pub fn channels(&self, kind: ChannelKind) -> impl Iterator<Item = ChannelId> {
        (1..=self.bound(kind)).map(move |index| ChannelId::new(kind, index))
    }
}

/// Control connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        f.write_str(label)
    }
}

/// Audio playback output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackChannel {
    #[default]
    Mono1,
    Mono2,
    Stereo,
}

impl PlaybackChannel {
    /// Byte carried in the playback frame
    pub fn wire_value(self) -> u8 {
        match self {
            PlaybackChannel::Mono1 => 0,
            PlaybackChannel::Mono2 => 1,
            PlaybackChannel::Stereo => 2,
        }
    }
}

impl TryFrom<u8> for PlaybackChannel {
    type Error = AhmError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PlaybackChannel::Mono1),
            1 => Ok(PlaybackChannel::Mono2),
            2 => Ok(PlaybackChannel::Stereo),
            other => Err(AhmError::invalid(format!(
                "playback channel {} out of range (0..=2)",
                other
            ))),
        }
    }
}
