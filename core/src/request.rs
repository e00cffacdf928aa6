//! Deferred one-sided requests.
//!
//! Each core owns one partition. Other cores append descriptors into it
//! during a superstep; only the owner reads it, during sync.

use crate::error::{BspError, Result};
use crate::registry::Region;

/// A deferred remote memory access, stored in the partition of the core
/// that owns the addressed memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `len` bytes of the owner's `src` region and ship them back to
    /// `requester`'s `dst` region.
    Get {
        requester: usize,
        src: Region,
        src_offset: usize,
        dst: Region,
        dst_offset: usize,
        len: usize,
    },
    /// Write `payload`, captured when the put was issued, into the owner's
    /// `dst` region.
    Put {
        dst: Region,
        offset: usize,
        payload: Vec<u8>,
    },
}

impl Request {
    pub fn len(&self) -> usize {
        match self {
            Request::Get { len, .. } => *len,
            Request::Put { payload, .. } => payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes resolved for a get, delivered to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub dst: Region,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct RequestPartition {
    requests: Vec<Request>,
    payload_bytes: usize,
    max_requests: usize,
    max_payload_bytes: usize,
}

impl RequestPartition {
    pub fn new(max_requests: usize, max_payload_bytes: usize) -> Self {
        Self {
            requests: Vec::new(),
            payload_bytes: 0,
            max_requests,
            max_payload_bytes,
        }
    }

    pub fn push(&mut self, request: Request) -> Result<()> {
        if self.requests.len() == self.max_requests {
            return Err(BspError::CapacityExceeded {
                what: "request",
                capacity: self.max_requests,
            });
        }
        // A put buffers its payload here; a get makes the owner copy `len`
        // bytes into a reply. Both count against the same budget.
        let payload_bytes = self
            .payload_bytes
            .checked_add(request.len())
            .filter(|&total| total <= self.max_payload_bytes)
            .ok_or(BspError::CapacityExceeded {
                what: "request payload",
                capacity: self.max_payload_bytes,
            })?;
        self.payload_bytes = payload_bytes;
        self.requests.push(request);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Empties the partition, resetting its counters.
    pub fn take(&mut self) -> Vec<Request> {
        self.payload_bytes = 0;
        std::mem::take(&mut self.requests)
    }
}
