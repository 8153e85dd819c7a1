//! The boundary between the driver and the USB stack.
//!
//! [`MidiPort`] is what the driver needs from below. [`QueuePort`] implements it with two
//! [`heapless::spsc`] rings and a [`LinkStatus`] made of atomics, so the side facing the USB peripheral can run in
//! interrupt context (or in an executor task standing in for it) without any lock: it owns a [`TxReader`] and an
//! [`RxWriter`], the driver owns the [`QueuePort`], and each ring has exactly one producer and one consumer.
//!
//! Queuing a packet raises a [`Signal`], so the task draining the transmit ring can sleep until there is work.

use crate::{
    error::PortError,
    packet::{PACKET_LEN, UsbMidiPacket},
};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use heapless::spsc::{Consumer, Producer, Queue};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// What the driver needs from a USB-MIDI endpoint pair. None of these may block.
pub trait MidiPort {
    /// Takes exclusive ownership of the endpoint pair. Calling it again after success is a no-op.
    ///
    /// A port fronting a peripheral which is still coming out of reset may fail with [`PortError::Busy`]; the driver
    /// retries those until its init timeout runs out. [`QueuePort`] is ready as soon as it exists and never does.
    fn claim(&mut self) -> Result<(), PortError>;

    /// Current bus state as last reported by the USB stack.
    fn link(&self) -> LinkState;

    /// Number of packets which can be queued for transmission right now.
    fn tx_free(&self) -> usize;

    /// Hands a packet to the USB layer, failing with [`PortError::Full`] instead of waiting for room.
    fn try_send(&mut self, packet: UsbMidiPacket) -> Result<(), PortError>;

    /// Takes the oldest received packet, if any.
    fn try_recv(&mut self) -> Option<UsbMidiPacket>;

    /// Packets lost before they reached the driver, e.g. because the receive ring was full.
    fn rx_overruns(&self) -> u32 {
        0
    }
}

/// Bus state, as published by the USB stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// No host, or the peripheral is disabled.
    Detached,
    /// Powered and reset by a host, but not configured yet.
    Attached,
    /// The host selected a configuration; MIDI traffic may flow.
    Configured,
    /// The host suspended the bus.
    Suspended,
    /// The USB stack reported an unrecoverable condition.
    Fault,
}

/// Link state and counters shared between the USB side and the driver.
///
/// Meant to live in a `static`.
pub struct LinkStatus {
    state: AtomicU8,
    claimed: AtomicBool,
    rx_overruns: AtomicU32,
    tx_pending: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatus {
    /// Starts out [`Detached`][LinkState::Detached] and unclaimed.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Detached as u8),
            claimed: AtomicBool::new(false),
            rx_overruns: AtomicU32::new(0),
            tx_pending: Signal::new(),
        }
    }

    /// Getter.
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(LinkState::Fault)
    }

    /// Publishes a new bus state. Called from the USB side.
    pub fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically marks the endpoint pair as taken, returning `false` if it already was.
    fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// `true` once a driver has claimed the endpoint pair.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn record_overrun(&self, count: u32) {
        self.rx_overruns.fetch_add(count, Ordering::Relaxed);
    }

    /// Getter.
    pub fn rx_overruns(&self) -> u32 {
        self.rx_overruns.load(Ordering::Relaxed)
    }
}

/// Backing storage for one [`QueuePort`]: a transmit and a receive ring.
///
/// A `Queue<_, N>` holds at most `N - 1` packets.
pub struct PortQueues<const TX: usize, const RX: usize> {
    tx: Queue<UsbMidiPacket, TX>,
    rx: Queue<UsbMidiPacket, RX>,
}

impl<const TX: usize, const RX: usize> Default for PortQueues<TX, RX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const TX: usize, const RX: usize> PortQueues<TX, RX> {
    /// Constructs empty rings.
    pub const fn new() -> Self {
        Self {
            tx: Queue::new(),
            rx: Queue::new(),
        }
    }

    /// Hands out the driver-side port and the two USB-side halves.
    pub fn split<'a>(
        &'a mut self,
        status: &'a LinkStatus,
    ) -> (QueuePort<'a, TX, RX>, TxReader<'a, TX>, RxWriter<'a, RX>) {
        let (tx_producer, tx_consumer) = self.tx.split();
        let (rx_producer, rx_consumer) = self.rx.split();
        (
            QueuePort {
                tx: tx_producer,
                rx: rx_consumer,
                status,
                claimed: false,
            },
            TxReader {
                tx: tx_consumer,
                status,
            },
            RxWriter {
                rx: rx_producer,
                status,
            },
        )
    }
}

/// The driver-side end of a [`PortQueues`].
pub struct QueuePort<'a, const TX: usize, const RX: usize> {
    tx: Producer<'a, UsbMidiPacket, TX>,
    rx: Consumer<'a, UsbMidiPacket, RX>,
    status: &'a LinkStatus,
    claimed: bool,
}

impl<const TX: usize, const RX: usize> MidiPort for QueuePort<'_, TX, RX> {
    fn claim(&mut self) -> Result<(), PortError> {
        if self.claimed {
            return Ok(());
        }
        if !self.status.try_claim() {
            return Err(PortError::Claimed);
        }
        self.claimed = true;
        Ok(())
    }

    fn link(&self) -> LinkState {
        self.status.state()
    }

    fn tx_free(&self) -> usize {
        self.tx.capacity() - self.tx.len()
    }

    fn try_send(&mut self, packet: UsbMidiPacket) -> Result<(), PortError> {
        self.tx.enqueue(packet).map_err(|_| PortError::Full)?;
        self.status.tx_pending.signal(());
        Ok(())
    }

    fn try_recv(&mut self) -> Option<UsbMidiPacket> {
        self.rx.dequeue()
    }

    fn rx_overruns(&self) -> u32 {
        self.status.rx_overruns()
    }
}

/// USB-side consumer of outgoing packets.
pub struct TxReader<'a, const TX: usize> {
    tx: Consumer<'a, UsbMidiPacket, TX>,
    status: &'a LinkStatus,
}

impl<const TX: usize> TxReader<'_, TX> {
    /// Sleeps until at least one packet is queued.
    pub async fn ready(&self) {
        while self.is_empty() {
            self.status.tx_pending.wait().await;
        }
    }

    /// Takes the oldest queued packet.
    pub fn next_packet(&mut self) -> Option<UsbMidiPacket> {
        self.tx.dequeue()
    }

    /// Moves as many whole packets as fit into `buf`, so they can go out in one bulk transfer. Returns the number of
    /// bytes written.
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        for slot in buf.chunks_exact_mut(PACKET_LEN) {
            match self.tx.dequeue() {
                Some(packet) => {
                    slot.copy_from_slice(packet.as_bytes());
                    written += PACKET_LEN;
                }
                None => break,
            }
        }
        written
    }

    /// `true` if nothing is waiting to go out.
    pub fn is_empty(&self) -> bool {
        !self.tx.ready()
    }
}

/// USB-side producer of received packets.
pub struct RxWriter<'a, const RX: usize> {
    rx: Producer<'a, UsbMidiPacket, RX>,
    status: &'a LinkStatus,
}

impl<const RX: usize> RxWriter<'_, RX> {
    /// Queues one packet, counting it as an overrun if the ring is full.
    pub fn push(&mut self, packet: UsbMidiPacket) -> bool {
        if self.rx.enqueue(packet).is_ok() {
            true
        } else {
            self.status.record_overrun(1);
            false
        }
    }

    /// Splits the payload of one OUT transfer into packets and queues them. Returns the number queued.
    ///
    /// A trailing chunk shorter than 4 bytes cannot be a packet and is dropped.
    pub fn push_bytes(&mut self, data: &[u8]) -> usize {
        let chunks = data.chunks_exact(PACKET_LEN);
        if !chunks.remainder().is_empty() {
            error!("USB-MIDI Event Packets must always be 32 bits long");
            self.status.record_overrun(1);
        }
        let mut queued = 0;
        for chunk in chunks {
            if let Ok(packet) = UsbMidiPacket::try_from(chunk) {
                if self.push(packet) {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Publishes a new bus state.
    pub fn set_link(&self, state: LinkState) {
        self.status.set_state(state);
    }

    /// Marks the start of a new session once the host has configured the device again, clearing any
    /// [`Fault`][LinkState::Fault] left behind by the previous one.
    pub fn reconnected(&self) {
        self.status.set_state(LinkState::Configured);
    }
}
