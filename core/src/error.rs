//! Error types for per-core runtime operations.

use thiserror::Error;

use crate::registry::Region;

/// Errors returned by the per-core API.
///
/// Contract violations that cannot be attributed to a single call (a
/// missing `sync`, a remote region that the owner never registered) are
/// not reported here: they end the run through the abort channel.
#[derive(Debug, Error)]
pub enum BspError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pid {pid} out of range for {nprocs} cores")]
    InvalidPid { pid: usize, nprocs: usize },

    #[error("region {0} is not registered")]
    InvalidRegion(Region),

    #[error("access of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("tag is {got} bytes but the tag size is {expected}")]
    TagSizeMismatch { expected: usize, got: usize },

    /// A request partition or message queue is full.
    #[error("{what} capacity of {capacity} exceeded")]
    CapacityExceeded { what: &'static str, capacity: usize },

    /// The external pool cannot satisfy the request; recoverable.
    #[error("external pool cannot satisfy {requested} bytes")]
    AllocationFailure { requested: usize },

    #[error("no external block is allocated at offset {0}")]
    InvalidFree(usize),

    /// An external handle that does not name a live block.
    #[error("handle at offset {0} does not name a live external block")]
    UnknownBlock(usize),

    #[error("external memory mapping failed: {0}")]
    Map(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BspError>;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = BspError::InvalidPid { pid: 9, nprocs: 4 };
        assert_eq!(err.to_string(), "pid 9 out of range for 4 cores");

        let err = BspError::CapacityExceeded { what: "request", capacity: 16 };
        assert_eq!(err.to_string(), "request capacity of 16 exceeded");

        let err = BspError::InvalidRegion(Region::new(3));
        assert_eq!(err.to_string(), "region #3 is not registered");
    }
}
