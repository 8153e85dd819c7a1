//! The transport driver: initialization and fault state, outbound encoding, inbound dispatch.
//!
//! The driver has no thread of its own. Outbound packets leave as soon as a `send_*` call hands them to the port;
//! inbound packets only progress when [`update()`][MidiTransportDriver::update] is called, so the main loop should
//! call it on every iteration.
//!
//! ```text
//!  Uninitialized ──init()──► Ready ──hard USB error──► Faulted
//!        │                     ▲                          │
//!        └──hard USB error─────┼──────────────────────────┤
//!                              └─────────init()───────────┘
//! ```

use crate::{
    configuration::DriverConfig,
    error::{ErrorCode, PortError},
    handler::{MidiHandler, NullHandler},
    message::{ChannelVoiceMessage, Message, SystemMessage},
    packet::{PacketEvent, UsbMidiPacket},
    port::{LinkState, MidiPort},
    sysex::{self, SysExAssembler, SysExError},
};
use embassy_time::Instant;

/// Upper bound on stale packets discarded by `init()`, so a chattering host cannot keep it busy.
const MAX_STALE_PACKETS: usize = 256;

/// Lifecycle of a [`MidiTransportDriver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverState {
    /// `init()` has not succeeded yet.
    Uninitialized,
    /// Sending and receiving.
    Ready,
    /// A hard USB error ended the session; only `init()` leaves this state.
    Faulted,
}

/// Traffic counters since the last successful `init()` from a non-ready state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverStats {
    /// Packets handed to the port.
    pub sent: u32,
    /// Outbound messages rejected with [`ErrorCode::BufferFull`].
    pub tx_dropped: u32,
    /// Inbound messages delivered to the handler.
    pub received: u32,
    /// Inbound packets discarded as malformed.
    pub malformed: u32,
    /// Inbound SysEx messages discarded for exceeding the reassembly buffer.
    pub sysex_overflow: u32,
    /// Inbound packets lost before reaching the driver.
    pub rx_overruns: u32,
}

/// Maps logical MIDI operations onto a USB-MIDI endpoint pair reached through a [`MidiPort`].
///
/// Every operation completes in bounded time and reports failure through [`ErrorCode`]; none of them panic.
pub struct MidiTransportDriver<P, H = NullHandler> {
    port: P,
    handler: H,
    config: DriverConfig,
    state: DriverState,
    claimed: bool,
    /// Set once the host has configured the device during this session; a later detach is then a disconnect
    /// rather than a host which has not shown up yet.
    seen_configured: bool,
    sysex: SysExAssembler,
    stats: DriverStats,
    overrun_base: u32,
}

impl<P: MidiPort> MidiTransportDriver<P> {
    /// Constructs an uninitialized driver which discards inbound messages.
    pub fn new(port: P, config: DriverConfig) -> Self {
        Self::with_handler(port, NullHandler, config)
    }
}

impl<P: MidiPort, H: MidiHandler> MidiTransportDriver<P, H> {
    /// Constructs an uninitialized driver which passes inbound messages to `handler`.
    pub fn with_handler(port: P, handler: H, config: DriverConfig) -> Self {
        Self {
            port,
            handler,
            config,
            state: DriverState::Uninitialized,
            claimed: false,
            seen_configured: false,
            sysex: SysExAssembler::new(),
            stats: DriverStats::default(),
            overrun_base: 0,
        }
    }

    /// Claims the endpoint pair, resets buffers and counters, and moves to [`DriverState::Ready`].
    ///
    /// Calling it while already ready succeeds without touching anything, so the endpoint is never claimed twice.
    /// From [`DriverState::Faulted`] it runs the same reset path as the first call, provided the link no longer
    /// reports a fault.
    ///
    /// The only wait in the driver happens here: while the port reports the peripheral as busy, the claim is retried
    /// until [`DriverConfig::init_timeout`] elapses.
    pub fn init(&mut self) -> Result<(), ErrorCode> {
        if self.state == DriverState::Ready {
            debug!("MIDI driver already initialized");
            return Ok(());
        }

        if !self.claimed {
            self.claim_port()?;
        }

        let link = self.port.link();
        if link == LinkState::Fault {
            error!("USB stack reports a fault; MIDI driver stays {}", self.state);
            return Err(ErrorCode::UsbStackFault);
        }

        let mut stale = 0;
        while stale < MAX_STALE_PACKETS && self.port.try_recv().is_some() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale inbound packets", stale);
        }

        self.sysex.reset();
        self.stats = DriverStats::default();
        self.overrun_base = self.port.rx_overruns();
        self.seen_configured = link == LinkState::Configured;
        self.state = DriverState::Ready;
        info!("MIDI driver ready on cable {} (link {})", self.config.cable.get(), link);
        Ok(())
    }

    fn claim_port(&mut self) -> Result<(), ErrorCode> {
        let deadline = Instant::now()
            .checked_add(self.config.init_timeout)
            .unwrap_or(Instant::MAX);
        loop {
            match self.port.claim() {
                Ok(()) => {
                    self.claimed = true;
                    return Ok(());
                }
                Err(PortError::Busy) if Instant::now() < deadline => core::hint::spin_loop(),
                Err(e) => {
                    warn!("Could not claim USB MIDI endpoint: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Sends a Control Change message.
    ///
    /// Fails with [`ErrorCode::NotReady`] before `init()` or after a fault, and with
    /// [`ErrorCode::InvalidParameter`] if `channel` exceeds 15 or `controller`/`value` exceed 127; neither produces
    /// any USB traffic. [`ErrorCode::BufferFull`] and [`ErrorCode::UsbNotEnumerated`] are worth retrying on a later
    /// cycle. Success means the packet reached the USB layer, not that the host received it.
    pub fn send_cc(&mut self, channel: u8, controller: u8, value: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::control_change(channel, controller, value))
    }

    /// Sends a Note On message. Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::note_on(channel, note, velocity))
    }

    /// Sends a Note Off message. Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_note_off(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::note_off(channel, note, velocity))
    }

    /// Sends polyphonic key pressure. Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_poly_pressure(&mut self, channel: u8, note: u8, pressure: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::poly_pressure(channel, note, pressure))
    }

    /// Sends a Program Change message. Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_program_change(&mut self, channel: u8, program: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::program_change(channel, program))
    }

    /// Sends channel pressure. Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_channel_pressure(&mut self, channel: u8, pressure: u8) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::channel_pressure(channel, pressure))
    }

    /// Sends a pitch bend with a 14-bit `value` (8192 is centre). Same contract as [`send_cc()`][Self::send_cc].
    pub fn send_pitch_bend(&mut self, channel: u8, value: u16) -> Result<(), ErrorCode> {
        self.send_with(|| ChannelVoiceMessage::pitch_bend(channel, value))
    }

    /// Sends an already validated channel voice message.
    pub fn send_message(&mut self, msg: ChannelVoiceMessage) -> Result<(), ErrorCode> {
        self.send_with(|| Ok(msg))
    }

    /// Sends a system common or real-time message.
    pub fn send_system(&mut self, msg: SystemMessage) -> Result<(), ErrorCode> {
        self.ensure_ready()?;
        let packet = UsbMidiPacket::from_system(self.config.cable, &msg)?;
        self.transmit(packet)
    }

    /// Sends a complete System Exclusive message, 0xF0 through 0xF7.
    ///
    /// The message is queued all-or-nothing: if the port cannot take every packet right now, nothing is queued and
    /// [`ErrorCode::BufferFull`] is returned.
    pub fn send_sysex(&mut self, data: &[u8]) -> Result<(), ErrorCode> {
        self.ensure_ready()?;
        sysex::validate(data)?;
        self.check_link()?;

        let needed = sysex::packet_count(data.len());
        if self.port.tx_free() < needed {
            self.stats.tx_dropped = self.stats.tx_dropped.saturating_add(1);
            debug!("No room for {} SysEx packets", needed);
            return Err(ErrorCode::BufferFull);
        }
        for packet in sysex::packets(self.config.cable, data) {
            if let Err(e) = self.port.try_send(packet) {
                return self.port_failure(e);
            }
            self.stats.sent = self.stats.sent.saturating_add(1);
        }
        Ok(())
    }

    /// Drains up to [`DriverConfig::max_packets_per_update`] inbound packets and passes each decoded message to the
    /// handler.
    ///
    /// Never fails and never blocks. Malformed packets are counted in [`DriverStats::malformed`] and dropped; packets
    /// for another cable are ignored. A hard USB error observed here moves the driver to [`DriverState::Faulted`],
    /// but packets already buffered are still delivered. Does nothing before `init()`.
    pub fn update(&mut self) {
        match self.state {
            DriverState::Uninitialized => return,
            DriverState::Ready => {
                // only the transition to Faulted matters here
                let _ = self.check_link();
            }
            DriverState::Faulted => {}
        }

        for _ in 0..self.config.max_packets_per_update {
            let Some(packet) = self.port.try_recv() else {
                break;
            };
            self.dispatch(packet);
        }
    }

    fn dispatch(&mut self, packet: UsbMidiPacket) {
        let cable = packet.cable();
        if cable != self.config.cable {
            trace!("Ignoring packet for cable {}", cable.get());
            return;
        }

        match packet.decode() {
            Ok(PacketEvent::ChannelVoice(msg)) => {
                self.stats.received = self.stats.received.saturating_add(1);
                self.handler.on_message(cable, Message::ChannelVoice(msg));
            }
            Ok(PacketEvent::System(msg)) => {
                self.stats.received = self.stats.received.saturating_add(1);
                self.handler.on_message(cable, Message::System(msg));
            }
            Ok(PacketEvent::SysEx(fragment)) => match self.sysex.push(&fragment) {
                Ok(Some(bytes)) => {
                    self.stats.received = self.stats.received.saturating_add(1);
                    self.handler.on_message(cable, Message::SysEx(bytes));
                }
                Ok(None) => {}
                Err(SysExError::Overflow) => {
                    self.stats.sysex_overflow = self.stats.sysex_overflow.saturating_add(1);
                    debug!("Inbound SysEx too long; discarding it");
                }
                Err(SysExError::Unexpected) => {
                    self.stats.malformed = self.stats.malformed.saturating_add(1);
                    debug!("SysEx continuation without a start: {}", packet.as_bytes());
                }
            },
            Err(_reason) => {
                self.stats.malformed = self.stats.malformed.saturating_add(1);
                debug!("Dropping malformed packet {} ({})", packet.as_bytes(), _reason);
            }
        }
    }

    fn send_with(
        &mut self,
        build: impl FnOnce() -> Result<ChannelVoiceMessage, ErrorCode>,
    ) -> Result<(), ErrorCode> {
        self.ensure_ready()?;
        let msg = build()?;
        self.transmit(UsbMidiPacket::from_channel_voice(self.config.cable, &msg))
    }

    fn ensure_ready(&self) -> Result<(), ErrorCode> {
        match self.state {
            DriverState::Ready => Ok(()),
            _ => Err(ErrorCode::NotReady),
        }
    }

    fn transmit(&mut self, packet: UsbMidiPacket) -> Result<(), ErrorCode> {
        self.check_link()?;
        match self.port.try_send(packet) {
            Ok(()) => {
                self.stats.sent = self.stats.sent.saturating_add(1);
                trace!("Queued {}", packet.as_bytes());
                Ok(())
            }
            Err(e) => self.port_failure(e),
        }
    }

    /// Classifies the link state; fatal states move the driver to [`DriverState::Faulted`].
    fn check_link(&mut self) -> Result<(), ErrorCode> {
        match self.port.link() {
            LinkState::Configured => {
                self.seen_configured = true;
                Ok(())
            }
            LinkState::Attached | LinkState::Suspended => Err(ErrorCode::UsbNotEnumerated),
            LinkState::Detached if self.seen_configured => self.fault(ErrorCode::UsbDisconnected),
            LinkState::Detached => Err(ErrorCode::UsbNotEnumerated),
            LinkState::Fault => self.fault(ErrorCode::UsbStackFault),
        }
    }

    fn port_failure(&mut self, e: PortError) -> Result<(), ErrorCode> {
        let code = ErrorCode::from(e);
        if code == ErrorCode::BufferFull {
            self.stats.tx_dropped = self.stats.tx_dropped.saturating_add(1);
            debug!("MIDI transmit ring full");
            Err(code)
        } else if code.is_fatal() {
            self.fault(code)
        } else {
            Err(code)
        }
    }

    fn fault(&mut self, code: ErrorCode) -> Result<(), ErrorCode> {
        if self.state != DriverState::Faulted {
            error!("MIDI driver faulted: {}", code);
            self.state = DriverState::Faulted;
        }
        Err(code)
    }

    /// Getter.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Shorthand for `state() == DriverState::Ready`.
    pub fn is_ready(&self) -> bool {
        self.state == DriverState::Ready
    }

    /// Traffic counters.
    pub fn stats(&self) -> DriverStats {
        DriverStats {
            rx_overruns: self.port.rx_overruns().wrapping_sub(self.overrun_base),
            ..self.stats
        }
    }

    /// Getter.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Getter.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Getter.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Getter.
    pub fn port(&self) -> &P {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{InboundEvent, Inbox},
        packet::CableNumber,
        port::{LinkStatus, PortQueues},
    };
    use embassy_time::{Duration, MockDriver};
    use heapless::{Deque, Vec};

    /// A port whose every aspect the test controls.
    struct MockPort {
        link: LinkState,
        sent: Vec<UsbMidiPacket, 64>,
        inbound: Deque<UsbMidiPacket, 64>,
        tx_capacity: usize,
        claims: u32,
        busy_claims: u32,
        claimed_elsewhere: bool,
        fail_send: Option<PortError>,
    }

    impl Default for MockPort {
        fn default() -> Self {
            Self {
                link: LinkState::Configured,
                sent: Vec::new(),
                inbound: Deque::new(),
                tx_capacity: 64,
                claims: 0,
                busy_claims: 0,
                claimed_elsewhere: false,
                fail_send: None,
            }
        }
    }

    impl MockPort {
        fn receive(&mut self, bytes: [u8; 4]) {
            self.inbound.push_back(UsbMidiPacket::from_bytes(bytes)).unwrap();
        }
    }

    impl MidiPort for MockPort {
        fn claim(&mut self) -> Result<(), PortError> {
            if self.claimed_elsewhere {
                return Err(PortError::Claimed);
            }
            if self.busy_claims > 0 {
                self.busy_claims -= 1;
                MockDriver::get().advance(Duration::from_millis(1));
                return Err(PortError::Busy);
            }
            self.claims += 1;
            Ok(())
        }

        fn link(&self) -> LinkState {
            self.link
        }

        fn tx_free(&self) -> usize {
            self.tx_capacity - self.sent.len()
        }

        fn try_send(&mut self, packet: UsbMidiPacket) -> Result<(), PortError> {
            if let Some(e) = self.fail_send {
                return Err(e);
            }
            if self.sent.len() >= self.tx_capacity {
                return Err(PortError::Full);
            }
            self.sent.push(packet).map_err(|_| PortError::Full)
        }

        fn try_recv(&mut self) -> Option<UsbMidiPacket> {
            self.inbound.pop_front()
        }
    }

    fn ready_driver() -> MidiTransportDriver<MockPort, Inbox<64>> {
        let mut driver = MidiTransportDriver::with_handler(MockPort::default(), Inbox::new(), DriverConfig::default());
        driver.init().unwrap();
        driver
    }

    #[test]
    fn send_cc_emits_one_control_change_packet() {
        let mut driver = ready_driver();
        assert_eq!(Ok(()), driver.send_cc(0, 1, 64));
        assert_eq!(
            &[UsbMidiPacket::from_bytes([0x0B, 0xB0, 0x01, 0x40])][..],
            &driver.port().sent[..],
            "Expected left but got right"
        );
        assert_eq!(1, driver.stats().sent);
    }

    #[test]
    fn every_legal_cc_is_accepted() {
        let mut driver = ready_driver();
        for channel in 0..16 {
            for data in 0..128 {
                driver.port.sent.clear();
                assert_eq!(Ok(()), driver.send_cc(channel, data, 127 - data));
                assert_eq!(1, driver.port().sent.len());
            }
        }
    }

    #[test]
    fn invalid_parameters_produce_no_traffic() {
        let mut driver = ready_driver();
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_cc(16, 1, 0));
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_cc(0, 128, 0));
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_cc(0, 1, 200));
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_pitch_bend(0, 0x4000));
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_sysex(&[0xF0, 0x80, 0xF7]));
        assert!(driver.port().sent.is_empty(), "Nothing should have been transmitted");
        assert_eq!(DriverState::Ready, driver.state());
    }

    #[test]
    fn send_before_init_is_not_ready() {
        let mut driver = MidiTransportDriver::new(MockPort::default(), DriverConfig::default());
        assert_eq!(Err(ErrorCode::NotReady), driver.send_cc(0, 1, 64));
        assert_eq!(Err(ErrorCode::NotReady), driver.send_sysex(&[0xF0, 0xF7]));
        assert!(driver.port().sent.is_empty());
        assert_eq!(0, driver.port().claims, "Sending must not claim the endpoint");
        assert_eq!(DriverState::Uninitialized, driver.state());
    }

    #[test]
    fn init_is_idempotent() {
        let mut driver = ready_driver();
        driver.send_cc(0, 1, 1).unwrap();
        assert_eq!(Ok(()), driver.init());
        assert_eq!(DriverState::Ready, driver.state());
        assert_eq!(1, driver.port().claims, "Endpoint must be claimed exactly once");
        assert_eq!(1, driver.stats().sent, "A redundant init must not reset anything");
    }

    #[test]
    fn init_reports_claim_conflicts() {
        let port = MockPort {
            claimed_elsewhere: true,
            ..MockPort::default()
        };
        let mut driver = MidiTransportDriver::new(port, DriverConfig::default());
        assert_eq!(Err(ErrorCode::EndpointUnavailable), driver.init());
        assert_eq!(DriverState::Uninitialized, driver.state());
    }

    #[test]
    fn init_waits_for_busy_peripheral_within_timeout() {
        // both cases share one test because they advance the same mock clock
        let port = MockPort {
            busy_claims: 3,
            ..MockPort::default()
        };
        let mut driver = MidiTransportDriver::new(port, DriverConfig::default());
        assert_eq!(Ok(()), driver.init(), "A briefly busy peripheral should be waited for");
        assert_eq!(1, driver.port().claims);

        let port = MockPort {
            busy_claims: u32::MAX,
            ..MockPort::default()
        };
        let config = DriverConfig {
            init_timeout: Duration::from_millis(20),
            ..DriverConfig::default()
        };
        let mut driver = MidiTransportDriver::new(port, config);
        assert_eq!(Err(ErrorCode::EndpointUnavailable), driver.init());
        assert_eq!(DriverState::Uninitialized, driver.state());
        assert_eq!(0, driver.port().claims);
    }

    #[test]
    fn unbounded_init_timeout_does_not_overflow() {
        let port = MockPort {
            busy_claims: 2,
            ..MockPort::default()
        };
        let config = DriverConfig {
            init_timeout: Duration::MAX,
            ..DriverConfig::default()
        };
        let mut driver = MidiTransportDriver::new(port, config);
        assert_eq!(Ok(()), driver.init());
        assert_eq!(1, driver.port().claims);
    }

    #[test]
    fn init_refuses_faulted_link() {
        let port = MockPort {
            link: LinkState::Fault,
            ..MockPort::default()
        };
        let mut driver = MidiTransportDriver::new(port, DriverConfig::default());
        assert_eq!(Err(ErrorCode::UsbStackFault), driver.init());
        assert_eq!(DriverState::Uninitialized, driver.state());
    }

    #[test]
    fn full_ring_is_retryable() {
        let mut driver = ready_driver();
        driver.port.tx_capacity = 1;
        assert_eq!(Ok(()), driver.send_cc(0, 1, 1));
        assert_eq!(Err(ErrorCode::BufferFull), driver.send_cc(0, 1, 2));
        assert_eq!(DriverState::Ready, driver.state(), "Buffer pressure must not fault the driver");
        assert_eq!(1, driver.stats().tx_dropped);

        driver.port.sent.clear();
        assert_eq!(Ok(()), driver.send_cc(0, 1, 2));
    }

    #[test]
    fn unconfigured_host_is_retryable() {
        let mut driver = MidiTransportDriver::new(
            MockPort {
                link: LinkState::Detached,
                ..MockPort::default()
            },
            DriverConfig::default(),
        );
        assert_eq!(Ok(()), driver.init(), "init should not require a host");
        assert_eq!(Err(ErrorCode::UsbNotEnumerated), driver.send_cc(0, 1, 64));

        driver.port.link = LinkState::Attached;
        assert_eq!(Err(ErrorCode::UsbNotEnumerated), driver.send_cc(0, 1, 64));
        driver.port.link = LinkState::Configured;
        assert_eq!(Ok(()), driver.send_cc(0, 1, 64));
        driver.port.link = LinkState::Suspended;
        assert_eq!(Err(ErrorCode::UsbNotEnumerated), driver.send_cc(0, 1, 64));
        assert_eq!(DriverState::Ready, driver.state());
    }

    #[test]
    fn disconnect_after_configuration_faults() {
        let mut driver = ready_driver();
        driver.port.link = LinkState::Detached;
        assert_eq!(Err(ErrorCode::UsbDisconnected), driver.send_cc(0, 1, 64));
        assert_eq!(DriverState::Faulted, driver.state());
        assert_eq!(Err(ErrorCode::NotReady), driver.send_cc(0, 1, 64));
        assert!(driver.port().sent.is_empty());
    }

    #[test]
    fn stack_fault_requires_reinit() {
        let mut driver = ready_driver();
        driver.port.fail_send = Some(PortError::Hardware);
        assert_eq!(Err(ErrorCode::UsbStackFault), driver.send_cc(0, 1, 64));
        assert_eq!(DriverState::Faulted, driver.state());
        assert_eq!(Err(ErrorCode::NotReady), driver.send_cc(0, 1, 64));

        driver.port.fail_send = None;
        assert_eq!(Ok(()), driver.init());
        assert_eq!(DriverState::Ready, driver.state());
        assert_eq!(1, driver.port().claims, "Re-init reuses the existing claim");
        assert_eq!(Ok(()), driver.send_cc(0, 1, 64));
    }

    #[test]
    fn update_dispatches_inbound_messages() {
        let mut driver = ready_driver();
        driver.port.receive([0x09, 0x90, 0x3C, 0x64]);
        driver.port.receive([0x0F, 0xF8, 0x00, 0x00]);
        driver.port.receive([0x04, 0xF0, 0x7D, 0x01]);
        driver.port.receive([0x07, 0x02, 0x03, 0xF7]);
        driver.update();

        let inbox = driver.handler_mut();
        assert_eq!(
            Some(InboundEvent::ChannelVoice(ChannelVoiceMessage::note_on(0, 60, 100).unwrap())),
            inbox.pop().map(|m| m.event)
        );
        assert_eq!(Some(InboundEvent::System(SystemMessage::TimingClock)), inbox.pop().map(|m| m.event));
        assert_eq!(Some(InboundEvent::SysEx(6)), inbox.pop().map(|m| m.event));
        assert!(inbox.is_empty());
        assert_eq!(3, driver.stats().received);
    }

    #[test]
    fn update_drops_and_counts_malformed_packets() {
        let mut driver = ready_driver();
        driver.port.receive([0x00, 0x00, 0x00, 0x00]);
        driver.port.receive([0x09, 0xB0, 0x01, 0x02]);
        driver.port.receive([0x0B, 0xB0, 0xFF, 0x02]);
        driver.port.receive([0x07, 0x01, 0x02, 0xF7]);
        driver.port.receive([0x0B, 0xB0, 0x07, 0x64]);
        driver.update();

        assert_eq!(4, driver.stats().malformed);
        assert_eq!(1, driver.handler().len(), "The one valid packet should still arrive");
        assert_eq!(DriverState::Ready, driver.state());
    }

    #[test]
    fn update_is_bounded() {
        let mut driver = ready_driver();
        for value in 0..40 {
            driver.port.receive([0x0B, 0xB0, 0x01, value]);
        }
        driver.update();
        assert_eq!(16, driver.handler().len());
        driver.update();
        assert_eq!(32, driver.handler().len());
        driver.update();
        assert_eq!(40, driver.handler().len());
        assert!(driver.port().inbound.is_empty());
    }

    #[test]
    fn update_ignores_other_cables() {
        let mut driver = ready_driver();
        driver.port.receive([0x1B, 0xB0, 0x01, 0x02]);
        driver.update();
        assert!(driver.handler().is_empty());
        assert_eq!(0, driver.stats().malformed);
    }

    #[test]
    fn update_before_init_does_nothing() {
        let mut port = MockPort::default();
        port.receive([0x0B, 0xB0, 0x01, 0x02]);
        let mut driver = MidiTransportDriver::with_handler(port, Inbox::<4>::new(), DriverConfig::default());
        driver.update();
        assert!(driver.handler().is_empty());
        assert_eq!(1, driver.port().inbound.len());
    }

    #[test]
    fn faulted_driver_still_drains_buffered_input() {
        let mut driver = ready_driver();
        driver.port.receive([0x0B, 0xB0, 0x01, 0x02]);
        driver.port.link = LinkState::Fault;
        driver.update();
        assert_eq!(DriverState::Faulted, driver.state());
        assert_eq!(1, driver.handler().len());
    }

    #[test]
    fn init_discards_stale_input() {
        let mut port = MockPort::default();
        port.receive([0x0B, 0xB0, 0x01, 0x02]);
        let mut driver = MidiTransportDriver::with_handler(port, Inbox::<4>::new(), DriverConfig::default());
        driver.init().unwrap();
        driver.update();
        assert!(driver.handler().is_empty());
    }

    #[test]
    fn sysex_is_all_or_nothing() {
        let mut driver = ready_driver();
        driver.port.tx_capacity = 2;
        let message = [0xF0, 0x7D, 0x01, 0x02, 0x03, 0x04, 0xF7];
        assert_eq!(Err(ErrorCode::BufferFull), driver.send_sysex(&message));
        assert!(driver.port().sent.is_empty(), "A partial SysEx must not be queued");

        driver.port.tx_capacity = 3;
        assert_eq!(Ok(()), driver.send_sysex(&message));
        assert_eq!(3, driver.port().sent.len());
    }

    #[test]
    fn other_senders_use_matching_cins() {
        let mut driver = ready_driver();
        driver.send_note_on(1, 60, 100).unwrap();
        driver.send_note_off(1, 60, 0).unwrap();
        driver.send_program_change(2, 5).unwrap();
        driver.send_pitch_bend(3, 8192).unwrap();
        driver.send_system(SystemMessage::Start).unwrap();
        let sent: Vec<[u8; 4], 8> = driver.port().sent.iter().map(|p| *p.as_bytes()).collect();
        assert_eq!(
            [
                [0x09, 0x91, 60, 100],
                [0x08, 0x81, 60, 0],
                [0x0C, 0xC2, 5, 0],
                [0x0E, 0xE3, 0x00, 0x40],
                [0x0F, 0xFA, 0x00, 0x00],
            ][..],
            sent[..],
            "Expected left but got right"
        );
    }

    #[test]
    fn invalid_system_messages_produce_no_traffic() {
        let mut driver = ready_driver();
        assert_eq!(
            Err(ErrorCode::InvalidParameter),
            driver.send_system(SystemMessage::SongSelect(0x80))
        );
        assert_eq!(
            Err(ErrorCode::InvalidParameter),
            driver.send_system(SystemMessage::SongPosition(0x4000))
        );
        assert!(driver.port().sent.is_empty());
        assert_eq!(Ok(()), driver.send_system(SystemMessage::SongPosition(0x3FFF)));
        assert_eq!(&[0x03, 0xF2, 0x7F, 0x7F], driver.port().sent[0].as_bytes());
    }

    #[test]
    fn configured_cable_is_used() {
        let config = DriverConfig {
            cable: CableNumber::new(2).unwrap(),
            ..DriverConfig::default()
        };
        let mut driver = MidiTransportDriver::new(MockPort::default(), config);
        driver.init().unwrap();
        driver.send_cc(0, 1, 64).unwrap();
        assert_eq!(0x2B, driver.port().sent[0].as_bytes()[0]);
    }

    #[test]
    fn works_over_queue_port() {
        let status = LinkStatus::new();
        let mut queues: PortQueues<8, 8> = PortQueues::new();
        let (port, mut tx, mut rx) = queues.split(&status);
        let mut driver = MidiTransportDriver::with_handler(port, Inbox::<8>::new(), DriverConfig::default());

        driver.init().unwrap();
        assert!(status.is_claimed());
        assert_eq!(Err(ErrorCode::UsbNotEnumerated), driver.send_cc(0, 1, 64));

        rx.set_link(LinkState::Configured);
        assert_eq!(Ok(()), driver.send_cc(0, 1, 64));
        assert_eq!(Err(ErrorCode::InvalidParameter), driver.send_cc(16, 1, 0));
        assert_eq!(Some(UsbMidiPacket::from_bytes([0x0B, 0xB0, 0x01, 0x40])), tx.next_packet());
        assert_eq!(None, tx.next_packet(), "Exactly one packet should have been transmitted");

        rx.push_bytes(&[0x0B, 0xB0, 0x07, 0x64, 0x0B, 0xB0, 0x0A, 0x40]);
        driver.update();
        assert_eq!(2, driver.handler().len());

        rx.set_link(LinkState::Detached);
        driver.update();
        assert_eq!(DriverState::Faulted, driver.state());
        assert_eq!(Err(ErrorCode::NotReady), driver.send_cc(0, 1, 64));
    }

    #[test]
    fn reconnection_clears_an_endpoint_fault() {
        let status = LinkStatus::new();
        let mut queues: PortQueues<8, 8> = PortQueues::new();
        let (port, _tx, rx) = queues.split(&status);
        let mut driver = MidiTransportDriver::new(port, DriverConfig::default());
        rx.set_link(LinkState::Configured);
        driver.init().unwrap();

        // the endpoint overflowed and the I/O loop gave up on the session
        rx.set_link(LinkState::Fault);
        assert_eq!(Err(ErrorCode::UsbStackFault), driver.send_cc(0, 1, 64));
        assert_eq!(Err(ErrorCode::UsbStackFault), driver.init());

        // the host reconnected
        rx.reconnected();
        assert_eq!(Ok(()), driver.init());
        assert_eq!(Ok(()), driver.send_cc(0, 1, 64));
    }

    #[test]
    fn overruns_are_reported() {
        let status = LinkStatus::new();
        let mut queues: PortQueues<4, 2> = PortQueues::new();
        let (port, _tx, mut rx) = queues.split(&status);
        let mut driver = MidiTransportDriver::new(port, DriverConfig::default());
        driver.init().unwrap();

        // the ring holds one packet
        rx.push(UsbMidiPacket::from_bytes([0x0B, 0xB0, 0x01, 0x02]));
        rx.push(UsbMidiPacket::from_bytes([0x0B, 0xB0, 0x01, 0x03]));
        assert_eq!(1, driver.stats().rx_overruns);
    }
}
