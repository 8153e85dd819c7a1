//! System Exclusive framing: splitting outbound messages into packets and reassembling inbound fragments.

use crate::{
    error::ErrorCode,
    packet::{CableNumber, CodeIndexNumber, SysExFragment, UsbMidiPacket},
};
use tinyvec::ArrayVec;

/// Largest inbound SysEx message, framing bytes included, that will be reassembled.
pub const SYSEX_CAPACITY: usize = 256;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;

/// Checks that `data` is a complete SysEx message: 0xF0, any number of data bytes, 0xF7.
pub fn validate(data: &[u8]) -> Result<(), ErrorCode> {
    match data {
        [SYSEX_START, body @ .., SYSEX_END] if body.iter().all(|&b| b <= 0x7F) => Ok(()),
        _ => Err(ErrorCode::InvalidParameter),
    }
}

/// Number of packets needed to carry `len` SysEx bytes.
pub const fn packet_count(len: usize) -> usize {
    len.div_ceil(3)
}

/// Splits a validated SysEx message into USB-MIDI packets.
///
/// Every packet but the last uses CIN 0x4; the last uses 0x5, 0x6 or 0x7 depending on how many bytes remain.
pub fn packets(cable: CableNumber, data: &[u8]) -> impl Iterator<Item = UsbMidiPacket> + '_ {
    let count = packet_count(data.len());
    data.chunks(3).enumerate().map(move |(i, chunk)| {
        let cin = match (i + 1 == count, chunk.len()) {
            (false, _) => CodeIndexNumber::SysExStart,
            (true, 1) => CodeIndexNumber::SystemCommon1OrSysExEnd1,
            (true, 2) => CodeIndexNumber::SysExEnd2,
            (true, _) => CodeIndexNumber::SysExEnd3,
        };
        let mut midi = [0; 3];
        midi[..chunk.len()].copy_from_slice(chunk);
        UsbMidiPacket::new(cable, cin, midi)
    })
}

/// Why an inbound SysEx message was abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SysExError {
    /// The message outgrew [`SYSEX_CAPACITY`]; the rest of it will be skipped.
    Overflow,
    /// A continuation or end fragment arrived without a preceding start.
    Unexpected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Receiving,
    Discarding,
}

/// Reassembles SysEx fragments into complete messages in a fixed-size buffer.
#[derive(Clone, Debug)]
pub struct SysExAssembler {
    buf: ArrayVec<[u8; SYSEX_CAPACITY]>,
    phase: Phase,
}

impl Default for SysExAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl SysExAssembler {
    /// Constructs an idle [`SysExAssembler`].
    pub fn new() -> Self {
        Self {
            buf: ArrayVec::default(),
            phase: Phase::Idle,
        }
    }

    /// Forgets any partially received message.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.phase = Phase::Idle;
    }

    /// `true` while between a start and an end fragment.
    pub fn in_progress(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Feeds one fragment. Returns the whole message, 0xF0 through 0xF7, once its final fragment arrives.
    ///
    /// A start fragment always begins a new message, abandoning any unfinished one.
    pub fn push(&mut self, fragment: &SysExFragment) -> Result<Option<&[u8]>, SysExError> {
        if fragment.is_start() {
            if self.phase == Phase::Receiving {
                debug!("SysEx restarted before previous message ended");
            }
            self.buf.clear();
            self.phase = Phase::Receiving;
        }

        match self.phase {
            Phase::Idle => Err(SysExError::Unexpected),
            Phase::Discarding => {
                if fragment.is_end() {
                    self.phase = Phase::Idle;
                }
                Ok(None)
            }
            Phase::Receiving => {
                let bytes = fragment.as_slice();
                if self.buf.len() + bytes.len() > SYSEX_CAPACITY {
                    self.buf.clear();
                    self.phase = if fragment.is_end() {
                        Phase::Idle
                    } else {
                        Phase::Discarding
                    };
                    return Err(SysExError::Overflow);
                }
                self.buf.extend_from_slice(bytes);
                if fragment.is_end() {
                    self.phase = Phase::Idle;
                    Ok(Some(self.buf.as_slice()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketEvent;

    fn fragments<'a>(data: &'a [u8]) -> impl Iterator<Item = SysExFragment> + 'a {
        packets(CableNumber::ZERO, data).map(|p| match p.decode() {
            Ok(PacketEvent::SysEx(f)) => f,
            other => panic!("Expected a SysEx fragment but got {other:?}"),
        })
    }

    #[test]
    fn validation() {
        assert_eq!(Ok(()), validate(&[0xF0, 0xF7]));
        assert_eq!(Ok(()), validate(&[0xF0, 0x7E, 0x00, 0x06, 0x01, 0xF7]));
        assert_eq!(Err(ErrorCode::InvalidParameter), validate(&[0xF0]));
        assert_eq!(Err(ErrorCode::InvalidParameter), validate(&[0x7E, 0xF7]));
        assert_eq!(Err(ErrorCode::InvalidParameter), validate(&[0xF0, 0x80, 0xF7]));
        assert_eq!(Err(ErrorCode::InvalidParameter), validate(&[]));
    }

    #[test]
    fn packet_cins_follow_remaining_length() {
        let mut iter = packets(CableNumber::ZERO, &[0xF0, 0x01, 0x02, 0x03, 0xF7]);
        assert_eq!(
            Some(UsbMidiPacket::from_bytes([0x04, 0xF0, 0x01, 0x02])),
            iter.next(),
            "Expected left but got right"
        );
        assert_eq!(
            Some(UsbMidiPacket::from_bytes([0x06, 0x03, 0xF7, 0x00])),
            iter.next(),
            "Expected left but got right"
        );
        assert_eq!(None, iter.next());

        let short: [u8; 2] = [0xF0, 0xF7];
        assert_eq!(1, packets(CableNumber::ZERO, &short).count());
        assert_eq!(2, packet_count(4));
        assert_eq!(2, packet_count(6));
    }

    #[test]
    fn reassembles_across_packets() {
        let data = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0x02, 0x03, 0xF7];
        let mut assembler = SysExAssembler::new();
        let mut complete = None;
        for fragment in fragments(&data) {
            if let Some(bytes) = assembler.push(&fragment).unwrap() {
                let mut copy = [0_u8; 8];
                copy.copy_from_slice(bytes);
                complete = Some(copy);
            }
        }
        assert_eq!(Some(data), complete, "Expected left but got right");
        assert!(!assembler.in_progress());
    }

    #[test]
    fn stray_continuation_is_rejected() {
        let mut assembler = SysExAssembler::new();
        let continuation = fragments(&[0xF0, 0x01, 0x02, 0x03, 0xF7]).nth(1).unwrap();
        assert_eq!(Err(SysExError::Unexpected), assembler.push(&continuation));
    }

    #[test]
    fn overflow_discards_until_end() {
        let mut data = [0x11_u8; SYSEX_CAPACITY + 10];
        data[0] = 0xF0;
        data[SYSEX_CAPACITY + 9] = 0xF7;

        let mut assembler = SysExAssembler::new();
        let mut overflows = 0;
        let mut completed = 0;
        for fragment in fragments(&data) {
            match assembler.push(&fragment) {
                Err(SysExError::Overflow) => overflows += 1,
                Ok(Some(_)) => completed += 1,
                Ok(None) => {}
                Err(e) => panic!("Unexpected error {e:?}"),
            }
        }
        assert_eq!(1, overflows, "Overflow should be reported once");
        assert_eq!(0, completed, "An overflowed message must not be delivered");
        assert!(!assembler.in_progress());

        // the assembler recovers for the next message
        let next = [0xF0, 0x01, 0xF7];
        let fragment = fragments(&next).next().unwrap();
        assert_eq!(Ok(Some(&next[..])), assembler.push(&fragment));
    }

    #[test]
    fn new_start_abandons_unfinished_message() {
        let mut assembler = SysExAssembler::new();
        let first = fragments(&[0xF0, 0x01, 0x02, 0x03, 0xF7]).next().unwrap();
        assert_eq!(Ok(None), assembler.push(&first));
        let second = [0xF0, 0x05, 0xF7];
        let fragment = fragments(&second).next().unwrap();
        assert_eq!(Ok(Some(&second[..])), assembler.push(&fragment));
    }
}
