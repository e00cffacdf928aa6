use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::debug;

use crate::error::{BspError, Result};
use crate::registry::span;

/// The external memory segment shared by every core.
///
/// Large and slow compared to the per-core registered regions; carved up by
/// the pool allocator. Blocks are addressed by offset, never by pointer.
pub struct ExternalMemory {
    base: NonNull<u8>,
    len: usize,
    _backing: Option<File>,
}

// The mapping is plain bytes; callers of read/write uphold exclusivity.
unsafe impl Send for ExternalMemory {}
unsafe impl Sync for ExternalMemory {}

impl ExternalMemory {
    /// Shared anonymous mapping, zero filled.
    pub fn anonymous(len: usize) -> Result<Self> {
        let size = non_zero(len)?;
        let base = unsafe {
            mmap::<File>(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                None,
                0,
            )?
        };
        debug!(len, "mapped anonymous external memory");
        Self::from_raw(base.cast(), len, None)
    }

    /// Formats `path` (create, truncate, size) and maps it shared, so the
    /// pool can be inspected from outside the process.
    pub fn file_backed(path: &Path, len: usize) -> Result<Self> {
        let size = non_zero(len)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        let base = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&file),
                0,
            )?
        };
        debug!(len, path = %path.display(), "mapped file-backed external memory");
        Self::from_raw(base.cast(), len, Some(file))
    }

    fn from_raw(base: *mut u8, len: usize, backing: Option<File>) -> Result<Self> {
        let base = NonNull::new(base).ok_or(BspError::Map(nix::errno::Errno::EFAULT))?;
        Ok(Self { base, len, _backing: backing })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `src` into the segment at `offset`.
    ///
    /// # Safety
    /// No other core may access the same bytes concurrently.
    pub unsafe fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        let range = span(offset, src.len(), self.len)?;
        let dest = self.base.as_ptr().add(range.start);
        std::ptr::copy_nonoverlapping(src.as_ptr(), dest, src.len());
        Ok(())
    }

    /// Copies bytes at `offset` into `dst`.
    ///
    /// # Safety
    /// No other core may write the same bytes concurrently.
    pub unsafe fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let range = span(offset, dst.len(), self.len)?;
        let src = self.base.as_ptr().add(range.start);
        std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        Ok(())
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.base.as_ptr().cast(), self.len) };
    }
}

fn non_zero(len: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(len)
        .ok_or_else(|| BspError::InvalidConfig("external memory size must be non-zero".into()))
}
