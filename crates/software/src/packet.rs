//! USB-MIDI 1.0 event packets.
//!
//! Every MIDI event crosses the bus as exactly 32 bits: a header byte holding the virtual cable number in the high
//! nibble and the Code Index Number (CIN) in the low nibble, followed by up to three MIDI bytes. Shorter messages are
//! zero-padded. See section 4 of the USB Device Class Definition for MIDI Devices, release 1.0.

use crate::{
    error::ErrorCode,
    message::{ChannelVoiceMessage, ChannelVoiceStatus, SystemMessage},
};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use wmidi::{FromBytesError, MidiMessage};

/// Size of a USB-MIDI event packet in bytes.
pub const PACKET_LEN: usize = 4;

/// A virtual MIDI cable (0-15), addressing one embedded jack of the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CableNumber(u8);

impl CableNumber {
    /// Cable 0, the only cable of a single-port device.
    pub const ZERO: Self = Self(0);

    /// Constructs a [`CableNumber`], rejecting anything above 15.
    pub const fn new(cable: u8) -> Result<Self, ErrorCode> {
        if cable < 16 {
            Ok(Self(cable))
        } else {
            Err(ErrorCode::InvalidParameter)
        }
    }

    /// Getter.
    pub const fn get(self) -> u8 {
        self.0
    }
}

/// The Code Index Number, classifying the MIDI bytes of a packet (table 4-1 of the USB-MIDI specification).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodeIndexNumber {
    /// Reserved for future extensions.
    Miscellaneous = 0x0,
    /// Reserved for future cable events.
    CableEvent = 0x1,
    /// Two-byte system common message (0xF1, 0xF3).
    SystemCommon2 = 0x2,
    /// Three-byte system common message (0xF2).
    SystemCommon3 = 0x3,
    /// SysEx starts or continues; three bytes.
    SysExStart = 0x4,
    /// Single-byte system common message, or SysEx ending with the following single byte.
    SystemCommon1OrSysExEnd1 = 0x5,
    /// SysEx ends with the following two bytes.
    SysExEnd2 = 0x6,
    /// SysEx ends with the following three bytes.
    SysExEnd3 = 0x7,
    /// Note Off.
    NoteOff = 0x8,
    /// Note On.
    NoteOn = 0x9,
    /// Polyphonic key pressure.
    PolyKeyPress = 0xA,
    /// Control Change.
    ControlChange = 0xB,
    /// Program Change.
    ProgramChange = 0xC,
    /// Channel pressure.
    ChannelPressure = 0xD,
    /// Pitch bend change.
    PitchBendChange = 0xE,
    /// A single unparsed byte; used here for system real-time messages.
    SingleByte = 0xF,
}

impl CodeIndexNumber {
    /// Number of meaningful MIDI bytes carried by a packet with this CIN, or `None` for the reserved values.
    pub const fn midi_len(self) -> Option<usize> {
        match self {
            Self::Miscellaneous | Self::CableEvent => None,
            Self::SystemCommon1OrSysExEnd1 | Self::SingleByte => Some(1),
            Self::SystemCommon2 | Self::SysExEnd2 | Self::ProgramChange | Self::ChannelPressure => Some(2),
            _ => Some(3),
        }
    }

    fn from_nibble(nibble: u8) -> Self {
        // all sixteen nibble values are variants
        Self::from_u8(nibble & 0x0F).unwrap_or(Self::Miscellaneous)
    }

    /// The only CIN allowed to carry `msg`.
    pub fn for_system(msg: &SystemMessage) -> Self {
        match msg {
            SystemMessage::MidiTimeCode(_) | SystemMessage::SongSelect(_) => Self::SystemCommon2,
            SystemMessage::SongPosition(_) => Self::SystemCommon3,
            SystemMessage::TuneRequest => Self::SystemCommon1OrSysExEnd1,
            _ => Self::SingleByte,
        }
    }
}

impl From<ChannelVoiceStatus> for CodeIndexNumber {
    fn from(status: ChannelVoiceStatus) -> Self {
        // channel voice CINs mirror the status nibble
        Self::from_nibble(status as u8)
    }
}

/// Reasons an inbound packet is discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// CIN 0x0 or 0x1.
    ReservedCodeIndex,
    /// A status byte which does not agree with the CIN.
    StatusMismatch,
    /// A byte which should be data has its high bit set.
    InvalidDataByte,
    /// A system status which is undefined or not valid for the CIN.
    InvalidSystemMessage,
    /// SysEx framing bytes in the wrong place.
    InvalidSysEx,
}

/// Up to three bytes of a System Exclusive message as carried by one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SysExFragment {
    bytes: [u8; 3],
    len: u8,
}

impl SysExFragment {
    /// The meaningful bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// `true` if this fragment opens a message (begins with 0xF0).
    pub fn is_start(&self) -> bool {
        self.bytes[0] == 0xF0
    }

    /// `true` if this fragment closes a message (ends with 0xF7).
    pub fn is_end(&self) -> bool {
        self.as_slice().last() == Some(&0xF7)
    }
}

/// The content of a well-formed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketEvent {
    /// A complete channel voice message.
    ChannelVoice(ChannelVoiceMessage),
    /// A complete system common or real-time message.
    System(SystemMessage),
    /// A piece of a System Exclusive message, to be reassembled by the receiver.
    SysEx(SysExFragment),
}

/// A 4-byte USB-MIDI event packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbMidiPacket([u8; PACKET_LEN]);

impl UsbMidiPacket {
    /// Assembles a packet from its header fields and MIDI bytes.
    pub const fn new(cable: CableNumber, cin: CodeIndexNumber, midi: [u8; 3]) -> Self {
        Self([cable.get() << 4 | cin as u8, midi[0], midi[1], midi[2]])
    }

    /// Wraps raw bytes as received from the bus. No validation happens until [`decode()`][Self::decode].
    pub const fn from_bytes(bytes: [u8; PACKET_LEN]) -> Self {
        Self(bytes)
    }

    /// Encodes a channel voice message; the CIN mirrors the status nibble.
    pub fn from_channel_voice(cable: CableNumber, msg: &ChannelVoiceMessage) -> Self {
        Self::new(cable, msg.status().into(), msg.to_bytes())
    }

    /// Encodes a system message. Real-time messages use CIN 0xF, Tune Request 0x5, the others 0x2 or 0x3.
    ///
    /// Fails if a data byte or the song position is out of range.
    pub fn from_system(cable: CableNumber, msg: &SystemMessage) -> Result<Self, ErrorCode> {
        let mut bytes = [0; 3];
        MidiMessage::try_from(*msg)?
            .copy_to_slice(&mut bytes)
            .map_err(|_| ErrorCode::InvalidParameter)?;
        Ok(Self::new(cable, CodeIndexNumber::for_system(msg), bytes))
    }

    /// The raw 32 bits.
    pub const fn as_bytes(&self) -> &[u8; PACKET_LEN] {
        &self.0
    }

    /// Getter.
    pub const fn cable(&self) -> CableNumber {
        CableNumber(self.0[0] >> 4)
    }

    /// Getter.
    pub fn code_index(&self) -> CodeIndexNumber {
        CodeIndexNumber::from_nibble(self.0[0])
    }

    /// The MIDI bytes this packet's CIN says are meaningful; empty for reserved CINs.
    pub fn midi_bytes(&self) -> &[u8] {
        let len = self.code_index().midi_len().unwrap_or(0);
        &self.0[1..1 + len]
    }

    /// Interprets the packet, checking that the CIN, status byte and data bytes agree.
    ///
    /// Padding bytes beyond the CIN's length are ignored.
    pub fn decode(&self) -> Result<PacketEvent, DecodeError> {
        let cin = self.code_index();
        let bytes = self.midi_bytes();
        match cin {
            CodeIndexNumber::Miscellaneous | CodeIndexNumber::CableEvent => {
                Err(DecodeError::ReservedCodeIndex)
            }
            CodeIndexNumber::NoteOff
            | CodeIndexNumber::NoteOn
            | CodeIndexNumber::PolyKeyPress
            | CodeIndexNumber::ControlChange
            | CodeIndexNumber::ProgramChange
            | CodeIndexNumber::ChannelPressure
            | CodeIndexNumber::PitchBendChange => Self::decode_channel_voice(cin, bytes),
            CodeIndexNumber::SystemCommon1OrSysExEnd1 if bytes[0] == 0xF7 => Ok(Self::fragment(bytes)),
            CodeIndexNumber::SystemCommon1OrSysExEnd1
            | CodeIndexNumber::SystemCommon2
            | CodeIndexNumber::SystemCommon3
            | CodeIndexNumber::SingleByte => Self::decode_system(cin, bytes),
            CodeIndexNumber::SysExStart | CodeIndexNumber::SysExEnd2 | CodeIndexNumber::SysExEnd3 => {
                let ends = cin != CodeIndexNumber::SysExStart;
                let (last, body) = match bytes.split_last() {
                    Some((&last, body)) => (last, body),
                    None => return Err(DecodeError::InvalidSysEx),
                };
                // 0xF0 may only open a fragment; 0xF7 may only close one
                let body_ok = body
                    .iter()
                    .enumerate()
                    .all(|(i, &b)| b <= 0x7F || (i == 0 && b == 0xF0));
                let last_ok = if ends { last == 0xF7 } else { last <= 0x7F };
                if body_ok && last_ok {
                    Ok(Self::fragment(bytes))
                } else {
                    Err(DecodeError::InvalidSysEx)
                }
            }
        }
    }

    fn decode_channel_voice(cin: CodeIndexNumber, bytes: &[u8]) -> Result<PacketEvent, DecodeError> {
        // channel voice CINs mirror the status nibble
        let status = ChannelVoiceStatus::from_u8(cin as u8)
            .filter(|&status| bytes[0] >> 4 == status as u8)
            .ok_or(DecodeError::StatusMismatch)?;
        let parsed = MidiMessage::from_bytes(bytes).map_err(|e| match e {
            FromBytesError::UnexpectedStatusByte => DecodeError::InvalidDataByte,
            _ => DecodeError::StatusMismatch,
        })?;
        let msg = ChannelVoiceMessage::try_from(parsed).map_err(|_| DecodeError::StatusMismatch)?;
        // a Note On with velocity 0 comes back as a Note Off; keep the status that was sent
        ChannelVoiceMessage::new(status, msg.channel(), msg.data1(), msg.data2())
            .map(PacketEvent::ChannelVoice)
            .map_err(|_| DecodeError::InvalidDataByte)
    }

    fn decode_system(cin: CodeIndexNumber, bytes: &[u8]) -> Result<PacketEvent, DecodeError> {
        let parsed = MidiMessage::from_bytes(bytes).map_err(|e| match e {
            FromBytesError::UnexpectedStatusByte => DecodeError::InvalidDataByte,
            _ => DecodeError::InvalidSystemMessage,
        })?;
        let msg = SystemMessage::try_from(parsed).map_err(|_| DecodeError::InvalidSystemMessage)?;
        if CodeIndexNumber::for_system(&msg) == cin {
            Ok(PacketEvent::System(msg))
        } else {
            Err(DecodeError::StatusMismatch)
        }
    }

    fn fragment(bytes: &[u8]) -> PacketEvent {
        let mut fragment = SysExFragment {
            bytes: [0; 3],
            len: bytes.len() as u8,
        };
        fragment.bytes[..bytes.len()].copy_from_slice(bytes);
        PacketEvent::SysEx(fragment)
    }
}

impl TryFrom<&[u8]> for UsbMidiPacket {
    type Error = ErrorCode;

    /// USB-MIDI event packets must always be 32 bits long.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; PACKET_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| ErrorCode::InvalidParameter)
    }
}
