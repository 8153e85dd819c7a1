//! Driver settings, fixed at construction.

use crate::packet::CableNumber;
use embassy_time::Duration;

/// One full-speed bulk transfer's worth: 64 bytes, 16 packets.
pub const DEFAULT_MAX_PACKETS_PER_UPDATE: usize = 16;

/// How long `init()` keeps retrying while the port reports the peripheral as busy.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Configures a [`MidiTransportDriver`][crate::MidiTransportDriver].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverConfig {
    /// Virtual cable used for outgoing packets; inbound packets for any other cable are ignored.
    pub cable: CableNumber,
    /// Upper bound on the packets handled by a single `update()` call.
    pub max_packets_per_update: usize,
    /// Bound on the wait for the peripheral during `init()`.
    pub init_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cable: CableNumber::ZERO,
            max_packets_per_update: DEFAULT_MAX_PACKETS_PER_UPDATE,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}
