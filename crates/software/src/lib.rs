//! This crate contains the architecture-agnostic half of a USB-MIDI transport: a non-blocking driver which maps
//! logical [MIDI](https://midi.org/midi-1-0) operations onto the 4-byte event packets defined by the
//! [USB Device Class Definition for MIDI Devices](https://www.usb.org/sites/default/files/midi10.pdf), tracks
//! initialization and fault state, and reports every failure through a typed [`ErrorCode`].
//!
//! Nothing in here touches hardware. The driver talks to the USB stack through the [`MidiPort`][port::MidiPort]
//! trait; [`QueuePort`][port::QueuePort] implements it with a pair of lock-free single-producer/single-consumer
//! rings so that the USB interrupt (or the executor task standing in for it) can feed and drain packets while the
//! main loop calls [`MidiTransportDriver::update()`].
//!
//! ```text
//!   main loop                          USB side (ISR / task)
//!   ─────────                          ─────────────────────
//!   send_cc() ──► TX ring ───────────► write_packet()
//!   update()  ◄── RX ring ◄─────────── read_packet()
//!                 LinkStatus ◄──────── configured / suspended / fault
//! ```

#![deny(missing_docs)]
#![no_std]

#[macro_use]
mod log;

pub mod configuration;
pub mod driver;
pub mod error;
pub mod handler;
pub mod message;
pub mod packet;
pub mod port;
pub mod sysex;

pub use configuration::DriverConfig;
pub use driver::{DriverState, DriverStats, MidiTransportDriver};
pub use error::{ErrorCode, error_code_to_string};
pub use handler::{InboundEvent, InboundMessage, Inbox, MidiHandler};
pub use message::{ChannelVoiceMessage, ChannelVoiceStatus, Message, SystemMessage};
pub use packet::{CableNumber, CodeIndexNumber, UsbMidiPacket};
