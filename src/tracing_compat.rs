//! Tracing compatibility layer.
//!
//! Re-exports the `tracing` macros when the `tracing-integration` feature is
//! enabled; otherwise provides no-op macros that compile to nothing, so the
//! rest of the crate can log unconditionally.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op stand-in for `tracing::trace!`.
    #[macro_export]
    macro_rules! _evio_trace {
        ($($arg:tt)*) => {};
    }
    /// No-op stand-in for `tracing::debug!`.
    #[macro_export]
    macro_rules! _evio_debug {
        ($($arg:tt)*) => {};
    }
    /// No-op stand-in for `tracing::info!`.
    #[macro_export]
    macro_rules! _evio_info {
        ($($arg:tt)*) => {};
    }
    /// No-op stand-in for `tracing::warn!`.
    #[macro_export]
    macro_rules! _evio_warn {
        ($($arg:tt)*) => {};
    }
    /// No-op stand-in for `tracing::error!`.
    #[macro_export]
    macro_rules! _evio_error {
        ($($arg:tt)*) => {};
    }

    pub use crate::_evio_debug as debug;
    pub use crate::_evio_error as error;
    pub use crate::_evio_info as info;
    pub use crate::_evio_trace as trace;
    pub use crate::_evio_warn as warn;
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::{debug, error, info, trace, warn};
