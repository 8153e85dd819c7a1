//! Logical MIDI messages, independent of how they are framed on the wire.
//!
//! Range invariants (channel 0-15, data bytes 0-127) are enforced by construction using [`wmidi`]'s [`Channel`] and
//! [`U7`] types, so a [`ChannelVoiceMessage`] that exists is always encodable.

use crate::error::ErrorCode;
use num_derive::{FromPrimitive, ToPrimitive};
use wmidi::{Channel, ControlFunction, MidiMessage, Note, U7, U14};

/// The high nibble of a channel voice status byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelVoiceStatus {
    /// Key released.
    NoteOff = 0x8,
    /// Key struck.
    NoteOn = 0x9,
    /// Per-key aftertouch.
    PolyPressure = 0xA,
    /// Controller number and 7-bit value.
    ControlChange = 0xB,
    /// Patch selection; a single data byte.
    ProgramChange = 0xC,
    /// Channel-wide aftertouch; a single data byte.
    ChannelPressure = 0xD,
    /// 14-bit pitch wheel, least significant 7 bits first.
    PitchBend = 0xE,
}

impl ChannelVoiceStatus {
    /// Number of data bytes that follow the status byte.
    pub const fn data_len(self) -> usize {
        match self {
            Self::ProgramChange | Self::ChannelPressure => 1,
            _ => 2,
        }
    }
}

/// A channel voice message: a status nibble, a channel and up to two 7-bit data bytes.
///
/// Messages with a single data byte ([`ProgramChange`][ChannelVoiceStatus::ProgramChange] and
/// [`ChannelPressure`][ChannelVoiceStatus::ChannelPressure]) always carry a zero `data2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelVoiceMessage {
    status: ChannelVoiceStatus,
    channel: Channel,
    data1: U7,
    data2: U7,
}

#[cfg(feature = "defmt")]
impl defmt::Format for ChannelVoiceMessage {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "{} {{ channel: {}, data1: {}, data2: {} }}",
            self.status,
            self.channel.index(),
            u8::from(self.data1),
            u8::from(self.data2)
        );
    }
}

fn data_byte(value: u8) -> Result<U7, ErrorCode> {
    U7::try_from(value).map_err(|_| ErrorCode::InvalidParameter)
}

impl ChannelVoiceMessage {
    /// Constructs a message from raw parts, rejecting a channel above 15 or a data byte above 127.
    ///
    /// For single-data-byte statuses `data2` must still be in range and is then discarded.
    pub fn new(status: ChannelVoiceStatus, channel: u8, data1: u8, data2: u8) -> Result<Self, ErrorCode> {
        let channel = Channel::from_index(channel).map_err(|_| ErrorCode::InvalidParameter)?;
        let data1 = data_byte(data1)?;
        let data2 = match status.data_len() {
            1 => {
                data_byte(data2)?;
                U7::MIN
            }
            _ => data_byte(data2)?,
        };
        Ok(Self {
            status,
            channel,
            data1,
            data2,
        })
    }

    /// Control Change for `controller` with `value`.
    pub fn control_change(channel: u8, controller: u8, value: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::ControlChange, channel, controller, value)
    }

    /// Note On for `note` with `velocity`.
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::NoteOn, channel, note, velocity)
    }

    /// Note Off for `note` with release `velocity`.
    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::NoteOff, channel, note, velocity)
    }

    /// Polyphonic key pressure for `note`.
    pub fn poly_pressure(channel: u8, note: u8, pressure: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::PolyPressure, channel, note, pressure)
    }

    /// Program Change to `program`.
    pub fn program_change(channel: u8, program: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::ProgramChange, channel, program, 0)
    }

    /// Channel pressure (aftertouch).
    pub fn channel_pressure(channel: u8, pressure: u8) -> Result<Self, ErrorCode> {
        Self::new(ChannelVoiceStatus::ChannelPressure, channel, pressure, 0)
    }

    /// Pitch bend with a 14-bit `value` (0-16383, centre 8192).
    pub fn pitch_bend(channel: u8, value: u16) -> Result<Self, ErrorCode> {
        if value > 0x3FFF {
            return Err(ErrorCode::InvalidParameter);
        }
        Self::new(
            ChannelVoiceStatus::PitchBend,
            channel,
            (value & 0x7F) as u8,
            (value >> 7) as u8,
        )
    }

    /// Getter.
    pub fn status(&self) -> ChannelVoiceStatus {
        self.status
    }

    /// Zero-based channel (0-15).
    pub fn channel(&self) -> u8 {
        self.channel.index()
    }

    /// Getter.
    pub fn data1(&self) -> u8 {
        self.data1.into()
    }

    /// Getter.
    pub fn data2(&self) -> u8 {
        self.data2.into()
    }

    /// The full status byte, i.e. status nibble and channel.
    pub fn status_byte(&self) -> u8 {
        self.to_bytes()[0]
    }

    /// MIDI wire bytes; the trailing byte is zero for single-data-byte messages.
    pub fn to_bytes(&self) -> [u8; 3] {
        let mut bytes = [0; 3];
        // no channel voice message is longer than three bytes, so this cannot fail
        let _ = MidiMessage::from(*self).copy_to_slice(&mut bytes);
        bytes
    }

    /// Number of meaningful bytes in [`to_bytes()`][Self::to_bytes].
    pub fn len(&self) -> usize {
        1 + self.status.data_len()
    }

    /// Always `false`; a channel voice message carries at least a status and one data byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl From<ChannelVoiceMessage> for MidiMessage<'static> {
    fn from(msg: ChannelVoiceMessage) -> Self {
        let ChannelVoiceMessage {
            status,
            channel,
            data1,
            data2,
        } = msg;
        match status {
            ChannelVoiceStatus::NoteOff => MidiMessage::NoteOff(channel, Note::from(data1), data2),
            ChannelVoiceStatus::NoteOn => MidiMessage::NoteOn(channel, Note::from(data1), data2),
            ChannelVoiceStatus::PolyPressure => {
                MidiMessage::PolyphonicKeyPressure(channel, Note::from(data1), data2)
            }
            ChannelVoiceStatus::ControlChange => {
                MidiMessage::ControlChange(channel, ControlFunction(data1), data2)
            }
            ChannelVoiceStatus::ProgramChange => MidiMessage::ProgramChange(channel, data1),
            ChannelVoiceStatus::ChannelPressure => MidiMessage::ChannelPressure(channel, data1),
            ChannelVoiceStatus::PitchBend => {
                let value = u16::from(u8::from(data2)) << 7 | u16::from(u8::from(data1));
                // two 7-bit halves never exceed 14 bits
                MidiMessage::PitchBendChange(channel, U14::try_from(value).unwrap_or(U14::MAX))
            }
        }
    }
}

impl TryFrom<MidiMessage<'_>> for ChannelVoiceMessage {
    type Error = ErrorCode;

    /// Fails for anything other than a channel voice message.
    ///
    /// [`wmidi`] reads a Note On with velocity 0 as a Note Off, and so does this conversion.
    fn try_from(msg: MidiMessage<'_>) -> Result<Self, Self::Error> {
        let note = |n: Note| U7::from_u8_lossy(u8::from(n));
        let (status, channel, data1, data2) = match msg {
            MidiMessage::NoteOff(c, n, v) => (ChannelVoiceStatus::NoteOff, c, note(n), v),
            MidiMessage::NoteOn(c, n, v) => (ChannelVoiceStatus::NoteOn, c, note(n), v),
            MidiMessage::PolyphonicKeyPressure(c, n, v) => (ChannelVoiceStatus::PolyPressure, c, note(n), v),
            MidiMessage::ControlChange(c, f, v) => (ChannelVoiceStatus::ControlChange, c, f.0, v),
            MidiMessage::ProgramChange(c, p) => (ChannelVoiceStatus::ProgramChange, c, p, U7::MIN),
            MidiMessage::ChannelPressure(c, p) => (ChannelVoiceStatus::ChannelPressure, c, p, U7::MIN),
            MidiMessage::PitchBendChange(c, v) => {
                let v = u16::from(v);
                (
                    ChannelVoiceStatus::PitchBend,
                    c,
                    U7::from_u8_lossy((v & 0x7F) as u8),
                    U7::from_u8_lossy((v >> 7) as u8),
                )
            }
            _ => return Err(ErrorCode::InvalidParameter),
        };
        Ok(Self {
            status,
            channel,
            data1,
            data2,
        })
    }
}

/// System common and system real-time messages.
///
/// These are decoded and passed on to the handler as-is; the driver never acts on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SystemMessage {
    /// 0xF1 with a quarter-frame byte.
    MidiTimeCode(u8),
    /// 0xF2 with a 14-bit position in MIDI beats.
    SongPosition(u16),
    /// 0xF3 with a song number.
    SongSelect(u8),
    /// 0xF6.
    TuneRequest,
    /// 0xF8.
    TimingClock,
    /// 0xFA.
    Start,
    /// 0xFB.
    Continue,
    /// 0xFC.
    Stop,
    /// 0xFE.
    ActiveSensing,
    /// 0xFF.
    Reset,
}

impl SystemMessage {
    /// Parses a status byte and its data bytes with [`wmidi`].
    ///
    /// Returns `None` for SysEx framing bytes (0xF0, 0xF7), undefined statuses (0xF4, 0xF5, 0xF9, 0xFD), a data byte
    /// with the high bit set or too few data bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        MidiMessage::from_bytes(bytes).ok().and_then(|msg| Self::try_from(msg).ok())
    }

    /// Rejects data bytes above 127 or a song position above 16383.
    pub fn validate(&self) -> Result<(), ErrorCode> {
        MidiMessage::try_from(*self).map(drop)
    }

    /// Real-time messages are single bytes that may be interleaved anywhere, even inside SysEx.
    pub fn is_real_time(&self) -> bool {
        matches!(
            self,
            Self::TimingClock | Self::Start | Self::Continue | Self::Stop | Self::ActiveSensing | Self::Reset
        )
    }
}

impl TryFrom<MidiMessage<'_>> for SystemMessage {
    type Error = ErrorCode;

    /// Fails for channel voice messages, SysEx and the undefined system statuses.
    fn try_from(msg: MidiMessage<'_>) -> Result<Self, Self::Error> {
        Ok(match msg {
            MidiMessage::MidiTimeCode(v) => Self::MidiTimeCode(v.into()),
            MidiMessage::SongPositionPointer(v) => Self::SongPosition(v.into()),
            MidiMessage::SongSelect(v) => Self::SongSelect(v.into()),
            MidiMessage::TuneRequest => Self::TuneRequest,
            MidiMessage::TimingClock => Self::TimingClock,
            MidiMessage::Start => Self::Start,
            MidiMessage::Continue => Self::Continue,
            MidiMessage::Stop => Self::Stop,
            MidiMessage::ActiveSensing => Self::ActiveSensing,
            MidiMessage::Reset => Self::Reset,
            _ => return Err(ErrorCode::InvalidParameter),
        })
    }
}

impl TryFrom<SystemMessage> for MidiMessage<'static> {
    type Error = ErrorCode;

    fn try_from(msg: SystemMessage) -> Result<Self, Self::Error> {
        Ok(match msg {
            SystemMessage::MidiTimeCode(v) => MidiMessage::MidiTimeCode(data_byte(v)?),
            SystemMessage::SongPosition(v) => {
                MidiMessage::SongPositionPointer(U14::try_from(v).map_err(|_| ErrorCode::InvalidParameter)?)
            }
            SystemMessage::SongSelect(v) => MidiMessage::SongSelect(data_byte(v)?),
            SystemMessage::TuneRequest => MidiMessage::TuneRequest,
            SystemMessage::TimingClock => MidiMessage::TimingClock,
            SystemMessage::Start => MidiMessage::Start,
            SystemMessage::Continue => MidiMessage::Continue,
            SystemMessage::Stop => MidiMessage::Stop,
            SystemMessage::ActiveSensing => MidiMessage::ActiveSensing,
            SystemMessage::Reset => MidiMessage::Reset,
        })
    }
}

/// A decoded inbound message, as delivered to a [`MidiHandler`][crate::MidiHandler].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Message<'a> {
    /// Note, controller, program, pressure or pitch bend traffic.
    ChannelVoice(ChannelVoiceMessage),
    /// System common or real-time traffic.
    System(SystemMessage),
    /// A complete System Exclusive message, including the leading 0xF0 and trailing 0xF7.
    SysEx(&'a [u8]),
}
