#![no_std]

// -------------------------------------------------------
// Layout Constants (Single Source of Truth)
// -------------------------------------------------------
pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

// Upper bound on the number of cores in one run.
pub const MAX_NPROCS: usize = 64;

// Request Buffer: per destination partition
pub const DEFAULT_MAX_REQUESTS: usize = 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * KIB;

// Message Queue: per queue (two per core)
pub const DEFAULT_MAX_MESSAGES: usize = 512;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * KIB;
pub const DEFAULT_TAGSIZE: usize = 0;

// External memory pool shared by every core
pub const DEFAULT_EXT_MEMORY_SIZE: usize = 16 * MIB;
pub const EXT_ALIGN: usize = 8;

// Diagnostic channel: one buffer for the whole system, NUL included
pub const DIAG_MESSAGE_SIZE: usize = 128;

// -------------------------------------------------------
// Sync State (polled by the host, written by the core)
// -------------------------------------------------------
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Init = 0,
    Ready = 1,
    Running = 2,
    AtSync = 3,
    Continue = 4,
    Finished = 5,
    Aborted = 6,
}

impl SyncState {
    pub const fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            0 => Some(Self::Init),
            1 => Some(Self::Ready),
            2 => Some(Self::Running),
            3 => Some(Self::AtSync),
            4 => Some(Self::Continue),
            5 => Some(Self::Finished),
            6 => Some(Self::Aborted),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> i8 {
        self as i8
    }

    /// Finished and Aborted are never left once entered.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

// -------------------------------------------------------
// Diagnostic flag encoding: 0 = slot empty, pid + 1 = owner
// -------------------------------------------------------
pub const DIAG_FLAG_EMPTY: u32 = 0;

pub const fn diag_flag_for(pid: usize) -> u32 {
    pid as u32 + 1
}

pub const fn diag_flag_owner(flag: u32) -> Option<usize> {
    if flag == DIAG_FLAG_EMPTY {
        None
    } else {
        Some(flag as usize - 1)
    }
}
