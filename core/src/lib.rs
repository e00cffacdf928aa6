//! Per-core runtime for bulk-synchronous parallel programs.
//!
//! A fixed set of cores runs the same program in supersteps. Within a
//! superstep a core computes locally and queues one-sided puts/gets and
//! tagged messages; [`Core::sync`] makes all of them visible at once.
//! The host polls the [`SharedBlock`] between supersteps.

pub mod alloc;
pub mod api;
pub mod barrier;
pub mod config;
pub mod error;
pub mod extmem;
pub mod handshake;
pub mod queue;
pub mod registry;
pub mod request;
pub mod shared;
pub mod spin;
mod superstep;
mod sync;

pub use self::alloc::ExtPtr;
pub use api::Core;
pub use config::Config;
pub use error::{BspError, Result};
pub use handshake::Halted;
pub use lockstep_common::SyncState;
pub use queue::Message;
pub use registry::Region;
pub use shared::SharedBlock;

/// Formats and sends a diagnostic message to the host.
#[macro_export]
macro_rules! bsp_log {
    ($core:expr, $($arg:tt)*) => {
        $core.log(::std::format_args!($($arg)*))
    };
}

/// Formats a message, reports it to the host and aborts the whole run.
#[macro_export]
macro_rules! bsp_abort {
    ($core:expr, $($arg:tt)*) => {
        $core.abort(::std::format_args!($($arg)*))
    };
}
