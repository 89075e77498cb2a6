//! Utility
#[macro_use]
pub(crate) mod pool;

/// Emit a trace record if the `log` feature is enabled.
macro_rules! ktrace {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        {
            log::trace!($($tt)*);
        }
    };
}

/// Emit a warning record if the `log` feature is enabled.
macro_rules! kwarn {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        {
            log::warn!($($tt)*);
        }
    };
}

/// Emit an info record if the `log` feature is enabled.
macro_rules! kinfo {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        {
            log::info!($($tt)*);
        }
    };
}

/// Emit an error record if the `log` feature is enabled.
macro_rules! kerror {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        {
            log::error!($($tt)*);
        }
    };
}
