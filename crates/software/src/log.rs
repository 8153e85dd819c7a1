//! Logging interface, contingent on the `defmt` feature.
//!
//! Every macro expands to nothing when the feature is disabled, so call sites cost nothing and the driver never
//! depends on a logger for correctness. Only use these in statement position.

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::trace!($($args)*)
    };
}

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::debug!($($args)*)
    };
}

macro_rules! info {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::info!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::warn!($($args)*)
    };
}

macro_rules! error {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        ::defmt::error!($($args)*)
    };
}
