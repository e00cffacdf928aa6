use std::path::PathBuf;

use lockstep_common::{
    DEFAULT_EXT_MEMORY_SIZE, DEFAULT_MAX_MESSAGES, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_REQUESTS, DEFAULT_TAGSIZE, MAX_NPROCS,
};

use crate::error::{BspError, Result};

/// Run-wide settings, fixed when the shared block is created.
#[derive(Debug, Clone)]
pub struct Config {
    pub nprocs: usize,
    /// Tag size of superstep 0.
    pub tagsize: usize,
    /// Descriptors per request partition.
    pub max_requests: usize,
    /// Put payload plus get length per request partition.
    pub max_payload_bytes: usize,
    /// Entries per message queue.
    pub max_messages: usize,
    /// Payload bytes per message queue.
    pub max_message_bytes: usize,
    pub ext_memory_size: usize,
    /// Back the external pool with this file instead of anonymous memory.
    pub ext_memory_path: Option<PathBuf>,
    /// Cores wait in Ready until the host releases them.
    pub wait_for_host: bool,
    /// Compare registration call counts across cores in supersteps that
    /// register or deregister.
    pub check_registration: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nprocs: 1,
            tagsize: DEFAULT_TAGSIZE,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ext_memory_size: DEFAULT_EXT_MEMORY_SIZE,
            ext_memory_path: None,
            wait_for_host: false,
            check_registration: true,
        }
    }
}

impl Config {
    pub fn new(nprocs: usize) -> Self {
        Self { nprocs, ..Self::default() }
    }

    pub fn with_tagsize(mut self, tagsize: usize) -> Self {
        self.tagsize = tagsize;
        self
    }

    pub fn with_request_capacity(mut self, max_requests: usize, max_payload_bytes: usize) -> Self {
        self.max_requests = max_requests;
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn with_queue_capacity(mut self, max_messages: usize, max_message_bytes: usize) -> Self {
        self.max_messages = max_messages;
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn with_ext_memory(mut self, size: usize) -> Self {
        self.ext_memory_size = size;
        self
    }

    pub fn with_ext_memory_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ext_memory_path = Some(path.into());
        self
    }

    pub fn with_wait_for_host(mut self, wait: bool) -> Self {
        self.wait_for_host = wait;
        self
    }

    pub fn with_registration_check(mut self, check: bool) -> Self {
        self.check_registration = check;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nprocs == 0 || self.nprocs > MAX_NPROCS {
            return Err(BspError::InvalidConfig(format!(
                "nprocs must be in 1..={MAX_NPROCS}, got {}",
                self.nprocs
            )));
        }
        let capacities = [
            ("max_requests", self.max_requests),
            ("max_messages", self.max_messages),
            ("ext_memory_size", self.ext_memory_size),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(BspError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
