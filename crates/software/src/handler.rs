//! Where decoded inbound messages go.

use crate::{
    message::{ChannelVoiceMessage, Message, SystemMessage},
    packet::CableNumber,
};
use heapless::Deque;

/// Receives every well-formed inbound message during [`update()`][crate::MidiTransportDriver::update].
///
/// Runs on the caller's stack inside `update()`, so implementations should return quickly.
pub trait MidiHandler {
    /// Called once per decoded message, in arrival order.
    fn on_message(&mut self, cable: CableNumber, message: Message<'_>);
}

/// Discards everything. The default when no handler is registered.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHandler;

impl MidiHandler for NullHandler {
    fn on_message(&mut self, _cable: CableNumber, _message: Message<'_>) {}
}

impl<F> MidiHandler for F
where
    F: FnMut(CableNumber, Message<'_>),
{
    fn on_message(&mut self, cable: CableNumber, message: Message<'_>) {
        self(cable, message)
    }
}

/// An owned copy of an inbound message. SysEx payloads are not retained, only their length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InboundEvent {
    /// See [`Message::ChannelVoice`].
    ChannelVoice(ChannelVoiceMessage),
    /// See [`Message::System`].
    System(SystemMessage),
    /// A complete SysEx message of this many bytes was received.
    SysEx(usize),
}

/// An [`InboundEvent`] with the cable it arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InboundMessage {
    /// Virtual cable the packet was addressed to.
    pub cable: CableNumber,
    /// What arrived; SysEx is reduced to its length because the payload is only borrowed during the callback.
    pub event: InboundEvent,
}

impl From<(CableNumber, Message<'_>)> for InboundMessage {
    fn from((cable, message): (CableNumber, Message<'_>)) -> Self {
        let event = match message {
            Message::ChannelVoice(msg) => InboundEvent::ChannelVoice(msg),
            Message::System(msg) => InboundEvent::System(msg),
            Message::SysEx(bytes) => InboundEvent::SysEx(bytes.len()),
        };
        Self { cable, event }
    }
}

/// A bounded queue of inbound messages for callers who prefer pulling to callbacks.
///
/// When full, the oldest message is dropped to make room, so the freshest controller values always survive.
pub struct Inbox<const N: usize> {
    queue: Deque<InboundMessage, N>,
    dropped: u32,
}

impl<const N: usize> Default for Inbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Inbox<N> {
    /// Constructs an empty [`Inbox`].
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            dropped: 0,
        }
    }

    /// Takes the oldest message.
    pub fn pop(&mut self) -> Option<InboundMessage> {
        self.queue.pop_front()
    }

    /// Getter.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Getter.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages discarded because the inbox was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl<const N: usize> MidiHandler for Inbox<N> {
    fn on_message(&mut self, cable: CableNumber, message: Message<'_>) {
        if self.queue.is_full() {
            self.queue.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        // cannot fail: room was made above
        let _ = self.queue.push_back(InboundMessage::from((cable, message)));
    }
}
