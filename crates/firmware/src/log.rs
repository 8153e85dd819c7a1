//! Logging, compiled out unless the `defmt` feature is enabled. Only use these in statement position.

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
