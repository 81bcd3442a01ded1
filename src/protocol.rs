//! Outgoing command encoding and query correlation keys
//!
//! Byte layouts:
//!
//! - mute: `9N CH 7F|3F 9N CH 00`
//! - NRPN parameter: `BN 63 CH BN 62 PP BN 06 VV`
//! - SysEx: `F0 00 00 1A 50 12 01 00 … F7`
//! - preset recall: `B0 00 BANK C0 PROGRAM`

use crate::channel_map::{Address, PresetAddress};
use crate::types::{Level, PlaybackChannel};
use bytes::{BufMut, BytesMut};

/// Default control port (unencrypted)
pub const DEFAULT_PORT: u16 = 51325;

/// SysEx header including protocol version bytes
pub const SYSEX_HEADER: [u8; 8] = [0xF0, 0x00, 0x00, 0x1A, 0x50, 0x12, 0x01, 0x00];

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Velocity sent to mute a channel
pub const MUTE_ON_VELOCITY: u8 = 0x7F;
/// Velocity sent to unmute a channel
pub const MUTE_OFF_VELOCITY: u8 = 0x3F;
/// Velocities at or above this decode as muted
pub const MUTE_THRESHOLD: u8 = 0x40;

/// Destination type byte for crosspoint sends (always a zone)
pub const SEND_DEST_ZONE: u8 = 0x01;

pub(crate) const CC_BANK_SELECT: u8 = 0x00;
pub(crate) const CC_DATA_ENTRY: u8 = 0x06;
pub(crate) const CC_NRPN_LSB: u8 = 0x62;
pub(crate) const CC_NRPN_MSB: u8 = 0x63;

// SysEx command bytes (first byte after `0N`)
pub(crate) const SYSEX_GET: u8 = 0x01;
pub(crate) const SYSEX_SEND_LEVEL: u8 = 0x02;
pub(crate) const SYSEX_SEND_MUTE: u8 = 0x03;
pub(crate) const SYSEX_PLAYBACK: u8 = 0x06;
pub(crate) const SYSEX_GET_NAME: u8 = 0x09;
pub(crate) const SYSEX_NAME_REPLY: u8 = 0x0A;
pub(crate) const SYSEX_GET_COLOUR: u8 = 0x0D;
pub(crate) const SYSEX_COLOUR_REPLY: u8 = 0x0E;

// Sub-commands of SYSEX_GET
pub(crate) const GET_MUTE: u8 = 0x09;
pub(crate) const GET_NRPN: u8 = 0x0B;
pub(crate) const GET_SEND: u8 = 0x0F;

/// NRPN parameter numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Level,
    InputTrim,
    PreampGain,
    Pad,
    Phantom,
}

impl Parameter {
    pub fn number(self) -> u8 {
        match self {
            Parameter::Level => 0x17,
            Parameter::InputTrim => 0x18,
            Parameter::PreampGain => 0x19,
            Parameter::Pad => 0x1A,
            Parameter::Phantom => 0x1B,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            0x17 => Some(Parameter::Level),
            0x18 => Some(Parameter::InputTrim),
            0x19 => Some(Parameter::PreampGain),
            0x1A => Some(Parameter::Pad),
            0x1B => Some(Parameter::Phantom),
            _ => None,
        }
    }
}

/// Crosspoint addressing: source channel plus destination zone note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendAddress {
    pub source: Address,
    pub dest_zone: u8,
}

/// Key correlating a GET with the frame that answers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Mute(Address),
    Level(Address),
    SendLevel(SendAddress),
    SendMute(SendAddress),
    Name(Address),
    Colour(Address),
}

/// A single logical operation on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetMute { address: Address, muted: bool },
    SetParameter { address: Address, parameter: Parameter, value: u8 },
    GetMute { address: Address },
    GetLevel { address: Address },
    SetSendLevel { send: SendAddress, level: Level },
    SetSendMute { send: SendAddress, muted: bool },
    GetSendLevel { send: SendAddress },
    GetSendMute { send: SendAddress },
    RecallPreset(PresetAddress),
    /// `track` is zero-based on the wire
    PlayTrack { channel: PlaybackChannel, track: u8 },
    GetName { address: Address },
    GetColour { address: Address },
}

impl Command {
    pub fn set_level(address: Address, level: Level) -> Self {
        Command::SetParameter {
            address,
            parameter: Parameter::Level,
            value: level,
        }
    }

    /// Correlation key, for commands that expect a reply
    pub fn query_key(&self) -> Option<QueryKey> {
        match *self {
            Command::GetMute { address } => Some(QueryKey::Mute(address)),
            Command::GetLevel { address } => Some(QueryKey::Level(address)),
            Command::GetSendLevel { send } => Some(QueryKey::SendLevel(send)),
            Command::GetSendMute { send } => Some(QueryKey::SendMute(send)),
            Command::GetName { address } => Some(QueryKey::Name(address)),
            Command::GetColour { address } => Some(QueryKey::Colour(address)),
            _ => None,
        }
    }

    /// Append the wire bytes for this command to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        match *self {
            Command::SetMute { address, muted } => {
                let status = 0x90 | address.midi_channel;
                let velocity = if muted {
                    MUTE_ON_VELOCITY
                } else {
                    MUTE_OFF_VELOCITY
                };
                dst.put_slice(&[status, address.note, velocity, status, address.note, 0x00]);
            }
            Command::SetParameter {
                address,
                parameter,
                value,
            } => {
                let status = 0xB0 | address.midi_channel;
                dst.put_slice(&[
                    status,
                    CC_NRPN_MSB,
                    address.note,
                    status,
                    CC_NRPN_LSB,
                    parameter.number(),
                    status,
                    CC_DATA_ENTRY,
                    value & 0x7F,
                ]);
            }
            Command::GetMute { address } => {
                put_sysex(dst, &[address.midi_channel, SYSEX_GET, GET_MUTE, address.note]);
            }
            Command::GetLevel { address } => {
                put_sysex(
                    dst,
                    &[
                        address.midi_channel,
                        SYSEX_GET,
                        GET_NRPN,
                        Parameter::Level.number(),
                        address.note,
                    ],
                );
            }
            Command::SetSendLevel { send, level } => {
                put_send(dst, SYSEX_SEND_LEVEL, send, level & 0x7F);
            }
            Command::SetSendMute { send, muted } => {
                let value = if muted {
                    MUTE_ON_VELOCITY
                } else {
                    MUTE_OFF_VELOCITY
                };
                put_send(dst, SYSEX_SEND_MUTE, send, value);
            }
            Command::GetSendLevel { send } => put_send_get(dst, SYSEX_SEND_LEVEL, send),
            Command::GetSendMute { send } => put_send_get(dst, SYSEX_SEND_MUTE, send),
            Command::RecallPreset(preset) => {
                dst.put_slice(&[0xB0, CC_BANK_SELECT, preset.bank, 0xC0, preset.program]);
            }
            Command::PlayTrack { channel, track } => {
                put_sysex(dst, &[0x00, SYSEX_PLAYBACK, channel.wire_value(), track & 0x7F]);
            }
            Command::GetName { address } => {
                put_sysex(dst, &[address.midi_channel, SYSEX_GET_NAME, address.note]);
            }
            Command::GetColour { address } => {
                put_sysex(dst, &[address.midi_channel, SYSEX_GET_COLOUR, address.note]);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

fn put_sysex(dst: &mut BytesMut, payload: &[u8]) {
    dst.reserve(SYSEX_HEADER.len() + payload.len() + 1);
    dst.put_slice(&SYSEX_HEADER);
    dst.put_slice(payload);
    dst.put_u8(SYSEX_END);
}

fn put_send(dst: &mut BytesMut, command: u8, send: SendAddress, value: u8) {
    put_sysex(
        dst,
        &[
            send.source.midi_channel,
            command,
            send.source.note,
            SEND_DEST_ZONE,
            send.dest_zone,
            value,
        ],
    );
}

fn put_send_get(dst: &mut BytesMut, command: u8, send: SendAddress) {
    put_sysex(
        dst,
        &[
            send.source.midi_channel,
            SYSEX_GET,
            GET_SEND,
            command,
            send.source.note,
            SEND_DEST_ZONE,
            send.dest_zone,
        ],
    );
}

/// Render bytes as upper-case hex for logging
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
