//! Stream framing and event decoding
//!
//! Decoding happens in two stages. [`MidiFramer`] lifts complete MIDI
//! messages out of the TCP byte stream, honouring running status (the
//! device omits repeated status bytes inside NRPN runs and mute pairs).
//! [`EventAssembler`] turns those messages into [`DeviceEvent`]s, keeping
//! NRPN and bank-select state across reads so a sequence split over
//! several segments is not lost.
//!
//! Malformed input is logged and skipped. The only errors that end a
//! framed stream are I/O errors from the socket.

use crate::channel_map::{preset_number_at, Address, PresetAddress};
use crate::error::{AhmError, Result};
use crate::protocol::{
    hex, Command, Parameter, QueryKey, SendAddress, CC_BANK_SELECT, CC_DATA_ENTRY, CC_NRPN_LSB,
    CC_NRPN_MSB, MUTE_THRESHOLD, SEND_DEST_ZONE, SYSEX_COLOUR_REPLY, SYSEX_END, SYSEX_HEADER,
    SYSEX_NAME_REPLY, SYSEX_SEND_LEVEL, SYSEX_SEND_MUTE, SYSEX_START,
};
use crate::types::Level;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest SysEx frame accepted before the buffer is treated as garbage
const MAX_SYSEX_LEN: usize = 256;

/// Header bytes that must match; the two version bytes after them are not checked
const SYSEX_MANUFACTURER: [u8; 6] = [0xF0, 0x00, 0x00, 0x1A, 0x50, 0x12];

/// A complete MIDI message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Full frame including `F0` and `F7`
    SysEx(Bytes),
    /// Channel message this protocol never uses (pressure, pitch bend)
    Ignored { status: u8 },
}

impl MidiMessage {
    fn from_channel_voice(status: u8, data: &[u8]) -> Self {
        let channel = status & 0x0F;
        match status & 0xF0 {
            0x80 => MidiMessage::NoteOff {
                channel,
                note: data[0],
                velocity: data[1],
            },
            0x90 => MidiMessage::NoteOn {
                channel,
                note: data[0],
                velocity: data[1],
            },
            0xB0 => MidiMessage::ControlChange {
                channel,
                controller: data[0],
                value: data[1],
            },
            0xC0 => MidiMessage::ProgramChange {
                channel,
                program: data[0],
            },
            _ => MidiMessage::Ignored { status },
        }
    }
}

/// Number of data bytes following a channel-voice status byte
fn data_len(status: u8) -> usize {
    match status & 0xF0 {
        0xC0 | 0xD0 => 1,
        _ => 2,
    }
}

fn is_status(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// Splits a byte stream into MIDI messages
#[derive(Debug, Default)]
pub struct MidiFramer {
    running_status: Option<u8>,
}

impl MidiFramer {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_sysex(&mut self, src: &mut BytesMut) -> Option<Option<MidiMessage>> {
        self.running_status = None;
        let interrupt = src
            .iter()
            .skip(1)
            .position(|&b| is_status(b))
            .map(|pos| pos + 1);

        match interrupt {
            Some(end) if src[end] == SYSEX_END => {
                let frame = src.split_to(end + 1).freeze();
                tracing::debug!("RX: {}", hex(&frame));
                Some(Some(MidiMessage::SysEx(frame)))
            }
            Some(end) => {
                let dropped = src.split_to(end);
                tracing::warn!(
                    "Discarding unterminated SysEx ({} bytes): {}",
                    dropped.len(),
                    hex(&dropped)
                );
                None
            }
            None if src.len() > MAX_SYSEX_LEN => {
                tracing::warn!("Discarding oversized SysEx ({} bytes)", src.len());
                src.clear();
                None
            }
            // Wait for the terminator
            None => Some(None),
        }
    }
}

impl Decoder for MidiFramer {
    type Item = MidiMessage;
    type Error = AhmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MidiMessage>> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            if first == SYSEX_START {
                match self.frame_sysex(src) {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }

            // Real-time bytes carry no data and leave running status alone
            if first >= 0xF8 {
                src.advance(1);
                continue;
            }

            // Stray terminators and system common messages reset running status
            if first >= 0xF1 {
                tracing::debug!("Skipping system byte {:02X}", first);
                self.running_status = None;
                src.advance(1);
                continue;
            }

            let (status, header_len) = if is_status(first) {
                (first, 1)
            } else if let Some(status) = self.running_status {
                (status, 0)
            } else {
                tracing::debug!("Skipping orphan data byte {:02X}", first);
                src.advance(1);
                continue;
            };

            let needed = header_len + data_len(status);
            let available = &src[header_len..src.len().min(needed)];
            if let Some(pos) = available.iter().position(|&b| is_status(b)) {
                let dropped = src.split_to(header_len + pos);
                tracing::warn!("Discarding truncated message: {}", hex(&dropped));
                self.running_status = None;
                continue;
            }
            if src.len() < needed {
                return Ok(None);
            }

            let raw = src.split_to(needed);
            tracing::debug!("RX: {}", hex(&raw));
            self.running_status = Some(status);
            return Ok(Some(MidiMessage::from_channel_voice(
                status,
                &raw[header_len..],
            )));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<MidiMessage>> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if !src.is_empty() {
            tracing::debug!("Discarding {} bytes of partial frame at EOF", src.len());
            src.clear();
        }
        self.running_status = None;
        Ok(None)
    }
}

/// State change or reply decoded from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Mute { address: Address, muted: bool },
    Level { address: Address, level: Level },
    /// NRPN parameter other than level (trim, gain, pad, phantom)
    Parameter { address: Address, parameter: u8, value: u8 },
    SendLevel { send: SendAddress, level: Level },
    SendMute { send: SendAddress, muted: bool },
    /// `None` when the device reported a blank name
    Name { address: Address, name: Option<String> },
    Colour { address: Address, colour: u8 },
    PresetRecalled(u16),
}

impl DeviceEvent {
    /// Key of the GET this event answers
    pub fn query_key(&self) -> Option<QueryKey> {
        match *self {
            DeviceEvent::Mute { address, .. } => Some(QueryKey::Mute(address)),
            DeviceEvent::Level { address, .. } => Some(QueryKey::Level(address)),
            DeviceEvent::SendLevel { send, .. } => Some(QueryKey::SendLevel(send)),
            DeviceEvent::SendMute { send, .. } => Some(QueryKey::SendMute(send)),
            DeviceEvent::Name { address, .. } => Some(QueryKey::Name(address)),
            DeviceEvent::Colour { address, .. } => Some(QueryKey::Colour(address)),
            DeviceEvent::Parameter { .. } | DeviceEvent::PresetRecalled(_) => None,
        }
    }
}

/// Mute state carried by a note-on velocity
pub fn velocity_is_muted(velocity: u8) -> bool {
    velocity >= MUTE_THRESHOLD
}

/// Decode a name payload.
///
/// The name ends at the first NUL; everything after it is padding.
/// Surrounding spaces are trimmed, so a payload of NULs or spaces means
/// "no name" rather than an empty one.
pub fn decode_name(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let raw = &raw[..end];
    if !raw.is_ascii() {
        tracing::warn!("Ignoring non-ASCII channel name: {}", hex(raw));
        return None;
    }
    let name = std::str::from_utf8(raw).ok()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NrpnState {
    note: Option<u8>,
    parameter: Option<u8>,
}

/// Builds [`DeviceEvent`]s from MIDI messages
#[derive(Debug, Default)]
pub struct EventAssembler {
    nrpn: [NrpnState; 16],
    bank: Option<u8>,
}

impl EventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one message. `Ok(None)` means it completed no event.
    pub fn push(&mut self, message: MidiMessage) -> Result<Option<DeviceEvent>> {
        match message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                // Velocity 0 closes the mute pair
                if velocity == 0 {
                    return Ok(None);
                }
                Ok(Some(DeviceEvent::Mute {
                    address: Address::new(channel, note),
                    muted: velocity_is_muted(velocity),
                }))
            }
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => Ok(self.control_change(channel, controller, value)),
            MidiMessage::ProgramChange { channel, program } => {
                self.program_change(channel, program)
            }
            MidiMessage::SysEx(frame) => decode_sysex(&frame).map(Some),
            MidiMessage::NoteOff { .. } | MidiMessage::Ignored { .. } => Ok(None),
        }
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) -> Option<DeviceEvent> {
        let state = &mut self.nrpn[channel as usize & 0x0F];
        match controller {
            CC_NRPN_MSB => {
                *state = NrpnState {
                    note: Some(value),
                    parameter: None,
                };
                None
            }
            CC_NRPN_LSB => {
                if state.note.is_some() {
                    state.parameter = Some(value);
                }
                None
            }
            CC_DATA_ENTRY => {
                let taken = std::mem::take(state);
                let (Some(note), Some(parameter)) = (taken.note, taken.parameter) else {
                    tracing::debug!("Data entry on channel {} without NRPN address", channel);
                    return None;
                };
                let address = Address::new(channel, note);
                if parameter == Parameter::Level.number() {
                    Some(DeviceEvent::Level {
                        address,
                        level: value,
                    })
                } else {
                    Some(DeviceEvent::Parameter {
                        address,
                        parameter,
                        value,
                    })
                }
            }
            CC_BANK_SELECT if channel == 0 => {
                self.bank = Some(value);
                None
            }
            _ => None,
        }
    }

    fn program_change(&mut self, channel: u8, program: u8) -> Result<Option<DeviceEvent>> {
        if channel != 0 {
            return Ok(None);
        }
        let Some(bank) = self.bank.take() else {
            tracing::debug!("Program change {:02X} without bank select", program);
            return Ok(None);
        };
        let number = preset_number_at(PresetAddress { bank, program })
            .map_err(|e| AhmError::MalformedFrame(e.to_string()))?;
        Ok(Some(DeviceEvent::PresetRecalled(number)))
    }
}

/// Decode a complete `F0 … F7` frame
pub fn decode_sysex(frame: &[u8]) -> Result<DeviceEvent> {
    let malformed = || AhmError::MalformedFrame(hex(frame));

    if frame.len() < SYSEX_HEADER.len() + 2
        || !frame.starts_with(&SYSEX_MANUFACTURER)
        || frame.last() != Some(&SYSEX_END)
    {
        return Err(malformed());
    }
    let payload = &frame[SYSEX_HEADER.len()..frame.len() - 1];

    match payload {
        [n, command @ (SYSEX_SEND_LEVEL | SYSEX_SEND_MUTE), note, SEND_DEST_ZONE, dest_zone, value] =>
        {
            let send = SendAddress {
                source: Address::new(*n, *note),
                dest_zone: *dest_zone,
            };
            if *command == SYSEX_SEND_LEVEL {
                Ok(DeviceEvent::SendLevel {
                    send,
                    level: *value,
                })
            } else {
                Ok(DeviceEvent::SendMute {
                    send,
                    muted: velocity_is_muted(*value),
                })
            }
        }
        [n, SYSEX_NAME_REPLY, note, name @ ..] => Ok(DeviceEvent::Name {
            address: Address::new(*n, *note),
            name: decode_name(name),
        }),
        [n, SYSEX_COLOUR_REPLY, note, colour] => Ok(DeviceEvent::Colour {
            address: Address::new(*n, *note),
            colour: *colour,
        }),
        _ => Err(malformed()),
    }
}

/// Framed codec for the control socket: decodes [`DeviceEvent`]s, encodes [`Command`]s
#[derive(Debug, Default)]
pub struct AhmCodec {
    framer: MidiFramer,
    assembler: EventAssembler,
}

impl AhmCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn assemble(&mut self, message: MidiMessage) -> Option<DeviceEvent> {
        match self.assembler.push(message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Discarding frame: {}", e);
                None
            }
        }
    }
}

impl Decoder for AhmCodec {
    type Item = DeviceEvent;
    type Error = AhmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DeviceEvent>> {
        while let Some(message) = self.framer.decode(src)? {
            if let Some(event) = self.assemble(message) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<DeviceEvent>> {
        while let Some(message) = self.framer.decode_eof(src)? {
            if let Some(event) = self.assemble(message) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

impl Encoder<Command> for AhmCodec {
    type Error = AhmError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        item.encode_into(dst);
        tracing::debug!("TX: {}", hex(&dst[start..]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysex(payload: &[u8]) -> Vec<u8> {
        let mut out = SYSEX_HEADER.to_vec();
        out.extend_from_slice(payload);
        out.push(SYSEX_END);
        out
    }

    fn decode_all(bytes: &[u8]) -> Vec<DeviceEvent> {
        let mut codec = AhmCodec::new();
        let mut buf = BytesMut::from(bytes);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn mute_frame_velocity_threshold() {
        for (velocity, muted) in [(0x3F, false), (0x40, true), (0x7F, true), (0x01, false)] {
            let events = decode_all(&[0x90, 0x00, velocity, 0x90, 0x00, 0x00]);
            assert_eq!(
                events,
                vec![DeviceEvent::Mute {
                    address: Address::new(0, 0),
                    muted
                }],
                "velocity {:02X}",
                velocity
            );
        }
    }

    #[test]
    fn mute_reencodes_to_the_same_state() {
        for velocity in [0x3F, 0x40, 0x7F] {
            let muted = velocity_is_muted(velocity);
            let bytes = Command::SetMute {
                address: Address::new(1, 2),
                muted,
            }
            .encode();
            let events = decode_all(&bytes);
            assert_eq!(
                events,
                vec![DeviceEvent::Mute {
                    address: Address::new(1, 2),
                    muted
                }]
            );
        }
    }

    #[test]
    fn nrpn_level_with_and_without_running_status() {
        let full = [0xB0, 0x63, 0x00, 0xB0, 0x62, 0x17, 0xB0, 0x06, 0x54];
        let running = [0xB0, 0x63, 0x00, 0x62, 0x17, 0x06, 0x54];
        let expected = vec![DeviceEvent::Level {
            address: Address::new(0, 0),
            level: 84,
        }];
        assert_eq!(decode_all(&full), expected);
        assert_eq!(decode_all(&running), expected);
    }

    #[test]
    fn nrpn_split_across_reads() {
        let mut codec = AhmCodec::new();
        let mut buf = BytesMut::from(&[0xB1, 0x63, 0x05, 0xB1][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x62, 0x17, 0xB1, 0x06]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x20]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(DeviceEvent::Level {
                address: Address::new(1, 5),
                level: 0x20
            })
        );
    }

    #[test]
    fn other_nrpn_parameters_are_surfaced() {
        let events = decode_all(&[0xB0, 0x63, 0x02, 0xB0, 0x62, 0x1B, 0xB0, 0x06, 0x7F]);
        assert_eq!(
            events,
            vec![DeviceEvent::Parameter {
                address: Address::new(0, 2),
                parameter: 0x1B,
                value: 0x7F
            }]
        );
    }

    #[test]
    fn preset_recall_echo() {
        assert_eq!(
            decode_all(&[0xB0, 0x00, 0x03, 0xC0, 0x73]),
            vec![DeviceEvent::PresetRecalled(500)]
        );
        assert_eq!(
            decode_all(&[0xB0, 0x00, 0x01, 0xC0, 0x00]),
            vec![DeviceEvent::PresetRecalled(129)]
        );
        // Bank 3 stops at 0x73
        assert!(decode_all(&[0xB0, 0x00, 0x03, 0xC0, 0x74]).is_empty());
    }

    #[test]
    fn crosspoint_frames() {
        let events = decode_all(&sysex(&[0x01, 0x02, 0x03, 0x01, 0x00, 0x50]));
        let send = SendAddress {
            source: Address::new(1, 3),
            dest_zone: 0,
        };
        assert_eq!(events, vec![DeviceEvent::SendLevel { send, level: 0x50 }]);

        let events = decode_all(&sysex(&[0x01, 0x03, 0x03, 0x01, 0x00, 0x3F]));
        assert_eq!(events, vec![DeviceEvent::SendMute { send, muted: false }]);
    }

    #[test]
    fn name_frames() {
        let mut payload = vec![0x00, 0x0A, 0x04];
        payload.extend_from_slice(b"Spotify\0\0\0");
        assert_eq!(
            decode_all(&sysex(&payload)),
            vec![DeviceEvent::Name {
                address: Address::new(0, 4),
                name: Some("Spotify".to_string())
            }]
        );

        let blank = sysex(&[0x01, 0x0A, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            decode_all(&blank),
            vec![DeviceEvent::Name {
                address: Address::new(1, 0),
                name: None
            }]
        );
    }

    #[test]
    fn sysex_header_checks_manufacturer_not_version() {
        let mut other_version = vec![0xF0, 0x00, 0x00, 0x1A, 0x50, 0x12, 0x02, 0x01];
        other_version.extend_from_slice(&[0x00, 0x0A, 0x00, b'M', b'i', b'c', 0xF7]);
        assert_eq!(
            decode_sysex(&other_version).unwrap(),
            DeviceEvent::Name {
                address: Address::new(0, 0),
                name: Some("Mic".to_string())
            }
        );

        let other_vendor = [0xF0, 0x00, 0x00, 0x1B, 0x50, 0x12, 0x01, 0x00, 0x00, 0x0A, 0x00, 0xF7];
        assert!(matches!(decode_sysex(&other_vendor), Err(AhmError::MalformedFrame(_))));
    }

    #[test]
    fn name_payload_rules() {
        assert_eq!(decode_name(b"Spotify\0\0\0").as_deref(), Some("Spotify"));
        assert_eq!(decode_name(&[0; 8]), None);
        assert_eq!(decode_name(b""), None);
        assert_eq!(decode_name(b"  \0"), None);
        assert_eq!(decode_name(b"Bar 2").as_deref(), Some("Bar 2"));
        assert_eq!(decode_name(b"A\0B\0").as_deref(), Some("A"));
        assert_eq!(decode_name(b" Patio \0\0").as_deref(), Some("Patio"));
    }

    #[test]
    fn colour_frame() {
        assert_eq!(
            decode_all(&sysex(&[0x02, 0x0E, 0x01, 0x05])),
            vec![DeviceEvent::Colour {
                address: Address::new(2, 1),
                colour: 5
            }]
        );
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut bytes = sysex(&[0x00, 0x7E, 0x01]);
        // SysEx cut short by a new status byte
        bytes.extend_from_slice(&[0xF0, 0x00, 0x00]);
        bytes.extend_from_slice(&[0x91, 0x02, 0x7F]);
        // Foreign manufacturer
        bytes.extend_from_slice(&[0xF0, 0x43, 0x10, 0xF7]);
        bytes.extend_from_slice(&[0x90, 0x01, 0x3F]);
        assert_eq!(
            decode_all(&bytes),
            vec![
                DeviceEvent::Mute {
                    address: Address::new(1, 2),
                    muted: true
                },
                DeviceEvent::Mute {
                    address: Address::new(0, 1),
                    muted: false
                },
            ]
        );
    }

    #[test]
    fn incomplete_sysex_waits_then_completes() {
        let frame = sysex(&[0x00, 0x0E, 0x00, 0x02]);
        let mut codec = AhmCodec::new();
        let mut buf = BytesMut::from(&frame[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);
        buf.extend_from_slice(&frame[6..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_discarded_at_eof() {
        let mut codec = AhmCodec::new();
        let mut buf = BytesMut::from(&[0xF0, 0x00, 0x00, 0x1A][..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_sysex_is_dropped() {
        let mut bytes = vec![0xF0];
        bytes.extend(std::iter::repeat(0x01).take(MAX_SYSEX_LEN + 1));
        let mut codec = AhmCodec::new();
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn realtime_bytes_do_not_break_running_status() {
        let events = decode_all(&[0x90, 0x03, 0x7F, 0xF8, 0x03, 0x00, 0x04, 0x7F]);
        assert_eq!(
            events,
            vec![
                DeviceEvent::Mute {
                    address: Address::new(0, 3),
                    muted: true
                },
                DeviceEvent::Mute {
                    address: Address::new(0, 4),
                    muted: true
                },
            ]
        );
    }

    #[test]
    fn events_share_keys_with_their_queries() {
        let address = Address::new(0, 7);
        let send = SendAddress {
            source: address,
            dest_zone: 2,
        };
        let pairs = [
            (Command::GetMute { address }, DeviceEvent::Mute { address, muted: true }),
            (Command::GetLevel { address }, DeviceEvent::Level { address, level: 1 }),
            (Command::GetSendLevel { send }, DeviceEvent::SendLevel { send, level: 1 }),
            (Command::GetSendMute { send }, DeviceEvent::SendMute { send, muted: false }),
            (Command::GetName { address }, DeviceEvent::Name { address, name: None }),
            (Command::GetColour { address }, DeviceEvent::Colour { address, colour: 1 }),
        ];
        for (command, event) in pairs {
            assert_eq!(command.query_key(), event.query_key());
        }
    }
}
