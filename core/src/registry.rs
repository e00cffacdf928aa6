//! Per-core table of registered regions.
//!
//! Regions are identified only by the order in which they were registered.
//! A region registered in superstep k is readable and writable locally at
//! once, but becomes a valid target for remote puts and gets only after the
//! sync that ends superstep k. Deregistration is deferred the same way.

use std::fmt;

use crate::error::{BspError, Result};

/// Positional handle of a registered region.
///
/// The same handle names the matching region on every core, provided all
/// cores registered in the same relative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region(u32);

impl Region {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Active,
    Retiring,
    Retired,
}

#[derive(Debug)]
struct Slot {
    memory: Vec<u8>,
    state: SlotState,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    // register + deregister calls so far, compared across cores
    calls: u32,
    dirty: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, size: usize) -> Region {
        let region = Region(self.slots.len() as u32);
        self.slots.push(Slot { memory: vec![0; size], state: SlotState::Pending });
        self.calls += 1;
        self.dirty = true;
        region
    }

    pub fn deregister(&mut self, region: Region) -> Result<()> {
        let slot = self
            .slots
            .get_mut(region.index())
            .ok_or(BspError::InvalidRegion(region))?;
        match slot.state {
            SlotState::Pending | SlotState::Active => slot.state = SlotState::Retiring,
            SlotState::Retiring | SlotState::Retired => return Err(BspError::InvalidRegion(region)),
        }
        self.calls += 1;
        self.dirty = true;
        Ok(())
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    /// Whether register/deregister was called since the last commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Applies pending registrations and deregistrations. Called by sync.
    pub fn commit(&mut self) {
        for slot in &mut self.slots {
            match slot.state {
                SlotState::Pending => slot.state = SlotState::Active,
                SlotState::Retiring => {
                    slot.state = SlotState::Retired;
                    slot.memory = Vec::new();
                }
                SlotState::Active | SlotState::Retired => {}
            }
        }
        self.dirty = false;
    }

    pub fn local(&self, region: Region) -> Result<&[u8]> {
        self.live_slot(region).map(|slot| slot.memory.as_slice())
    }

    pub fn local_mut(&mut self, region: Region) -> Result<&mut [u8]> {
        self.live_slot_mut(region).map(|slot| slot.memory.as_mut_slice())
    }

    /// Bytes of a local span; the region may have been registered this
    /// superstep.
    pub fn local_span_mut(&mut self, region: Region, offset: usize, len: usize) -> Result<&mut [u8]> {
        let memory = self.local_mut(region)?;
        let range = span(offset, len, memory.len())?;
        Ok(&mut memory[range])
    }

    /// Checks that `region` was registered before the current superstep.
    pub fn check_remote(&self, region: Region) -> Result<()> {
        match self.slots.get(region.index()).map(|slot| slot.state) {
            Some(SlotState::Active | SlotState::Retiring) => Ok(()),
            _ => Err(BspError::InvalidRegion(region)),
        }
    }

    /// Bytes of a remotely addressed span, owner side.
    pub fn remote(&self, region: Region, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_remote(region)?;
        let memory = &self.slots[region.index()].memory;
        let range = span(offset, len, memory.len())?;
        Ok(&memory[range])
    }

    pub fn remote_mut(&mut self, region: Region, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_remote(region)?;
        let memory = &mut self.slots[region.index()].memory;
        let range = span(offset, len, memory.len())?;
        Ok(&mut memory[range])
    }

    fn live_slot(&self, region: Region) -> Result<&Slot> {
        match self.slots.get(region.index()) {
            Some(slot) if slot.state != SlotState::Retired => Ok(slot),
            _ => Err(BspError::InvalidRegion(region)),
        }
    }

    fn live_slot_mut(&mut self, region: Region) -> Result<&mut Slot> {
        match self.slots.get_mut(region.index()) {
            Some(slot) if slot.state != SlotState::Retired => Ok(slot),
            _ => Err(BspError::InvalidRegion(region)),
        }
    }
}

pub(crate) fn span(offset: usize, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(BspError::OutOfBounds { offset, len, size }),
    }
}
