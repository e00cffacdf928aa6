use std::collections::{BTreeMap, HashMap};

use lockstep_common::EXT_ALIGN;

use crate::error::{BspError, Result};

/// Handle of a block in the external pool.
///
/// Plain data: it can be sent to other cores in a put or a message, and
/// they can access the same block through their own `Core`. Every access
/// is checked against the block the pool recorded at the handle's offset,
/// so a decoded handle cannot reach past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtPtr {
    offset: usize,
    len: usize,
}

impl ExtPtr {
    pub fn offset(self) -> usize {
        self.offset
    }

    /// Size requested at allocation.
    pub fn len(self) -> usize {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Fixed-width encoding for shipping a handle through puts or messages.
    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&(self.offset as u64).to_le_bytes());
        bytes[8..].copy_from_slice(&(self.len as u64).to_le_bytes());
        bytes
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let offset = u64::from_le_bytes(word) as usize;
        word.copy_from_slice(&bytes[8..]);
        let len = u64::from_le_bytes(word) as usize;
        Self { offset, len }
    }
}

/// First-fit allocator over the external pool.
///
/// Freed blocks go to an offset-ordered free list and are merged with
/// their neighbours; a free block that ends at the bump pointer is handed
/// back to the bump region instead. Live blocks never move.
#[derive(Debug)]
pub struct PoolAllocator {
    capacity: usize,
    bump: usize,
    free: BTreeMap<usize, usize>,
    live: HashMap<usize, usize>,
}

impl PoolAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bump: 0,
            free: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<ExtPtr> {
        let rounded = round_up(size.max(1)).ok_or(BspError::AllocationFailure { requested: size })?;

        // 1. Reuse a freed block
        let reusable = self
            .free
            .iter()
            .find(|(_, &len)| len >= rounded)
            .map(|(&offset, &len)| (offset, len));
        if let Some((offset, len)) = reusable {
            self.free.remove(&offset);
            if len > rounded {
                self.free.insert(offset + rounded, len - rounded);
            }
            self.live.insert(offset, rounded);
            return Ok(ExtPtr { offset, len: size });
        }

        // 2. Bump
        match self.bump.checked_add(rounded) {
            Some(end) if end <= self.capacity => {
                let offset = self.bump;
                self.bump = end;
                self.live.insert(offset, rounded);
                Ok(ExtPtr { offset, len: size })
            }
            _ => Err(BspError::AllocationFailure { requested: size }),
        }
    }

    pub fn free(&mut self, ptr: ExtPtr) -> Result<()> {
        let len = self
            .live
            .remove(&ptr.offset)
            .ok_or(BspError::InvalidFree(ptr.offset))?;
        let mut start = ptr.offset;
        let mut len = len;

        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.bump {
            self.bump = start;
        } else {
            self.free.insert(start, len);
        }
        Ok(())
    }

    /// Bytes held by live blocks, after rounding.
    pub fn live_bytes(&self) -> usize {
        self.live.values().sum()
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.bump + self.free.values().sum::<usize>()
    }

    /// Bytes `ptr` may address: its own length, capped by the extent the
    /// pool recorded for the block at its offset.
    pub fn accessible_len(&self, ptr: ExtPtr) -> Result<usize> {
        self.live
            .get(&ptr.offset)
            .map(|&extent| ptr.len.min(extent))
            .ok_or(BspError::UnknownBlock(ptr.offset))
    }
}

fn round_up(size: usize) -> Option<usize> {
    size.checked_add(EXT_ALIGN - 1).map(|s| s & !(EXT_ALIGN - 1))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_allocate_reuses_space() {
        let mut pool = PoolAllocator::new(64);
        let a = pool.allocate(64).unwrap();
        assert!(pool.allocate(1).is_err());
        pool.free(a).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_eq!(b.offset(), 0);
    }

    #[test]
    fn sizes_are_rounded_to_alignment() {
        let mut pool = PoolAllocator::new(1024);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(3).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), EXT_ALIGN);
        assert_eq!(a.len(), 1);
        assert_eq!(pool.live_bytes(), 2 * EXT_ALIGN);
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let mut pool = PoolAllocator::new(32);
        pool.allocate(24).unwrap();
        assert!(matches!(
            pool.allocate(16),
            Err(BspError::AllocationFailure { requested: 16 })
        ));
        pool.allocate(8).unwrap();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn adjacent_free_blocks_merge() {
        let mut pool = PoolAllocator::new(48);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        let _c = pool.allocate(16).unwrap();
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        // a and b coalesced into one 32 byte hole.
        let d = pool.allocate(32).unwrap();
        assert_eq!(d.offset(), 0);
    }

    #[test]
    fn freeing_the_tail_returns_it_to_the_bump_region() {
        let mut pool = PoolAllocator::new(64);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        pool.free(b).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.available(), 64);
        assert_eq!(pool.live_blocks(), 0);
        assert_eq!(pool.allocate(64).unwrap().offset(), 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = PoolAllocator::new(64);
        let a = pool.allocate(8).unwrap();
        pool.free(a).unwrap();
        assert!(matches!(pool.free(a), Err(BspError::InvalidFree(0))));
        assert!(matches!(pool.accessible_len(a), Err(BspError::UnknownBlock(0))));
    }

    #[test]
    fn cycles_within_capacity_never_fail() {
        let mut pool = PoolAllocator::new(256);
        for round in 0..100 {
            let sizes = [24, 8, 40, 16, 100];
            let blocks: Vec<_> = sizes.iter().map(|&n| pool.allocate(n).unwrap()).collect();
            // Free in a different order each round.
            for i in 0..blocks.len() {
                pool.free(blocks[(i + round) % blocks.len()]).unwrap();
            }
        }
        assert_eq!(pool.available(), 256);
    }

    #[test]
    fn handles_round_trip_through_bytes() {
        let mut pool = PoolAllocator::new(256);
        pool.allocate(40).unwrap();
        let ptr = pool.allocate(10).unwrap();
        assert_eq!(ExtPtr::from_le_bytes(ptr.to_le_bytes()), ptr);
    }

    #[test]
    fn decoded_handles_cannot_widen_their_block() {
        let mut pool = PoolAllocator::new(256);
        let ptr = pool.allocate(10).unwrap();
        assert_eq!(pool.accessible_len(ptr).unwrap(), 10);

        let mut bytes = ptr.to_le_bytes();
        bytes[8..].copy_from_slice(&1000u64.to_le_bytes());
        let widened = ExtPtr::from_le_bytes(bytes);
        assert_eq!(widened.len(), 1000);
        assert_eq!(pool.accessible_len(widened).unwrap(), 16);

        bytes[..8].copy_from_slice(&64u64.to_le_bytes());
        let stray = ExtPtr::from_le_bytes(bytes);
        assert!(matches!(pool.accessible_len(stray), Err(BspError::UnknownBlock(64))));
    }
}
