//! The closed set of failure reasons reported by the driver, plus the port-level faults they are classified from.
//!
//! Nothing in this crate panics on a runtime failure; every fallible operation returns `Result<(), ErrorCode>` and
//! leaves the decision to halt, retry or ignore to the caller.

use core::fmt;

/// A classified driver failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    /// A channel, data byte or SysEx frame was out of range. Nothing was sent.
    InvalidParameter,
    /// The driver is not [`Ready`][crate::DriverState::Ready]; call `init()` first (again, after a fault).
    NotReady,
    /// The USB MIDI endpoint pair could not be claimed, either because it belongs to another driver or because the
    /// peripheral stayed busy past the init timeout.
    EndpointUnavailable,
    /// The host has not configured the device yet, or has suspended the bus. Retry on a later cycle.
    UsbNotEnumerated,
    /// The outgoing ring is full. Retry on a later cycle.
    BufferFull,
    /// The host went away after having configured the device. Fatal for the session.
    UsbDisconnected,
    /// The USB stack reported a hardware fault. Fatal for the session.
    UsbStackFault,
}

impl ErrorCode {
    /// Returns a short, stable description suitable for diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid parameter",
            Self::NotReady => "driver not ready",
            Self::EndpointUnavailable => "USB MIDI endpoint unavailable",
            Self::UsbNotEnumerated => "USB not enumerated",
            Self::BufferFull => "transmit buffer full",
            Self::UsbDisconnected => "USB disconnected",
            Self::UsbStackFault => "USB stack fault",
        }
    }

    /// Returns `true` if the same call may succeed on a later loop iteration without re-initializing the driver.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::BufferFull | Self::UsbNotEnumerated)
    }

    /// Returns `true` if the error ends the current session, i.e. the driver moves to
    /// [`Faulted`][crate::DriverState::Faulted] when it observes it.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::UsbDisconnected | Self::UsbStackFault)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-function form of [`ErrorCode::as_str()`].
pub const fn error_code_to_string(code: ErrorCode) -> &'static str {
    code.as_str()
}

/// Raw faults reported by a [`MidiPort`][crate::port::MidiPort] implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError {
    /// The ring toward the USB stack has no room.
    Full,
    /// The peripheral is still coming out of reset; the claim may succeed shortly.
    ///
    /// Only ports which own the peripheral directly report this. [`QueuePort`][crate::port::QueuePort] never does.
    Busy,
    /// The endpoint pair is already owned by someone else.
    Claimed,
    /// The host is gone.
    Detached,
    /// The USB stack reported an unrecoverable condition.
    Hardware,
}

impl From<PortError> for ErrorCode {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Full => ErrorCode::BufferFull,
            PortError::Busy | PortError::Claimed => ErrorCode::EndpointUnavailable,
            PortError::Detached => ErrorCode::UsbDisconnected,
            PortError::Hardware => ErrorCode::UsbStackFault,
        }
    }
}
