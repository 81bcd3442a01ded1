//! Lookup tables between logical channels and protocol addressing
//!
//! Inputs and zones use note numbers 0-63 on MIDI channels 0 and 1,
//! control groups 0-31 on channel 2 and rooms 0-15 on channel 3. The
//! per-model bounds come from [`ModelLimits`]; nothing here knows which
//! hardware variant is attached.

use crate::error::{AhmError, Result};
use crate::protocol::SendAddress;
use crate::types::{ChannelId, ChannelKind, CrosspointId, ModelLimits, SourceKind, MAX_PRESET};

/// Wire address of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// MIDI channel nibble (`N`)
    pub midi_channel: u8,
    /// Zero-based note / parameter index (`CH`)
    pub note: u8,
}

impl Address {
    pub fn new(midi_channel: u8, note: u8) -> Self {
        Self { midi_channel, note }
    }

    /// Channel this address refers to, without model bounds
    pub fn channel(&self) -> Option<ChannelId> {
        let kind = ChannelKind::from_midi_channel(self.midi_channel)?;
        Some(ChannelId::new(kind, self.note.checked_add(1)?))
    }
}

/// Bank select + program change pair for a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetAddress {
    pub bank: u8,
    pub program: u8,
}

/// Highest program value in the final bank (preset 500)
const LAST_BANK_MAX_PROGRAM: u8 = 0x73;

/// Channel addressing for one device model
#[derive(Debug, Clone, Copy)]
pub struct ChannelMap {
    limits: ModelLimits,
}

impl ChannelMap {
    pub fn new(limits: ModelLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ModelLimits {
        &self.limits
    }

    /// Resolve a channel to its wire address
    pub fn address_of(&self, channel: ChannelId) -> Result<Address> {
        self.limits.check(channel)?;
        Ok(Address::new(channel.kind.midi_channel(), channel.index - 1))
    }

    /// Reverse of [`ChannelMap::address_of`]
    pub fn channel_at(&self, address: Address) -> Result<ChannelId> {
        let channel = address.channel().ok_or_else(|| {
            AhmError::invalid(format!(
                "no channel at MIDI channel {} note {}",
                address.midi_channel, address.note
            ))
        })?;
        self.limits.check(channel)?;
        Ok(channel)
    }

    /// Resolve a crosspoint to its source address and destination zone note
    pub fn send_address_of(&self, crosspoint: CrosspointId) -> Result<SendAddress> {
        self.limits.check_crosspoint(crosspoint)?;
        Ok(SendAddress {
            source: self.address_of(crosspoint.source_channel())?,
            dest_zone: crosspoint.dest_zone - 1,
        })
    }
}

/// Crosspoint a send address refers to, without model bounds
pub fn crosspoint_at(send: SendAddress) -> Option<CrosspointId> {
    let source = SourceKind::from_midi_channel(send.source.midi_channel)?;
    Some(CrosspointId::new(
        source,
        send.source.note.checked_add(1)?,
        send.dest_zone.checked_add(1)?,
    ))
}

/// Resolve a 1-based preset number to its bank and program
pub fn preset_address_of(number: u16) -> Result<PresetAddress> {
    if number == 0 || number > MAX_PRESET {
        return Err(AhmError::invalid(format!(
            "preset {} out of range (1..={})",
            number, MAX_PRESET
        )));
    }
    let zero_based = number - 1;
    Ok(PresetAddress {
        bank: (zero_based / 128) as u8,
        program: (zero_based % 128) as u8,
    })
}

/// Reverse of [`preset_address_of`]
pub fn preset_number_at(address: PresetAddress) -> Result<u16> {
    let in_range = match address.bank {
        0..=2 => address.program <= 0x7F,
        3 => address.program <= LAST_BANK_MAX_PROGRAM,
        _ => false,
    };
    if !in_range {
        return Err(AhmError::invalid(format!(
            "no preset at bank {} program {:#04x}",
            address.bank, address.program
        )));
    }
    Ok(address.bank as u16 * 128 + address.program as u16 + 1)
}
