use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use lockstep_common::SyncState;
use tracing::{debug, trace, warn};

use crate::alloc::ExtPtr;
use crate::error::{BspError, Result};
use crate::handshake::{format_bounded, halt};
use crate::queue::{Message, MessageQueue};
use crate::registry::{span, Region, Registry};
use crate::request::Request;
use crate::shared::SharedBlock;
use crate::spin::SpinLock;
use crate::sync::{Backoff, Ordering};

/// The per-core runtime: one per participating thread, created by
/// [`Core::begin`] and consumed by [`Core::end`].
///
/// Everything a core does to another core goes through the shared block
/// and only takes effect at the next [`Core::sync`].
pub struct Core {
    pub(crate) shared: Arc<SharedBlock>,
    pub(crate) pid: usize,
    pub(crate) nprocs: usize,
    pub(crate) superstep: u64,
    pub(crate) tagsize: usize,
    pub(crate) tagsize_next: usize,
    // Queue drained this superstep; senders append to the other one.
    pub(crate) queue_index: usize,
    pub(crate) read_cursor: usize,
    pub(crate) registry: Registry,
    started: Instant,
}

impl Core {
    // ==========================================
    // Lifecycle
    // ==========================================

    pub fn begin(shared: Arc<SharedBlock>, pid: usize) -> Result<Self> {
        shared.check_pid(pid)?;
        let tagsize = shared.initial_tagsize();
        let nprocs = shared.nprocs();
        let core = Self {
            shared,
            pid,
            nprocs,
            superstep: 0,
            tagsize,
            tagsize_next: tagsize,
            queue_index: 0,
            read_cursor: 0,
            registry: Registry::new(),
            started: Instant::now(),
        };

        core.publish(SyncState::Ready);
        if core.shared.config().wait_for_host {
            core.wait_for_continue();
        } else {
            core.publish(SyncState::Running);
        }
        debug!(pid, nprocs, "core started");
        Ok(core)
    }

    /// Marks this core as finished. The core takes no further part in
    /// supersteps.
    pub fn end(self) {
        self.publish(SyncState::Finished);
        debug!(pid = self.pid, supersteps = self.superstep, "core finished");
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Number of completed syncs.
    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    /// Seconds since `begin`.
    pub fn time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Seconds since run start, as last written by the host.
    pub fn host_time(&self) -> f32 {
        self.shared.host_time()
    }

    pub fn shared(&self) -> &Arc<SharedBlock> {
        &self.shared
    }

    pub(crate) fn publish(&self, state: SyncState) {
        self.shared.publish_state(self.pid, state);
    }

    /// Collective handshake with the host: park in AtSync until the host
    /// writes Continue.
    pub fn host_sync(&self) {
        self.publish(SyncState::AtSync);
        self.wait_for_continue();
    }

    fn wait_for_continue(&self) {
        let mut backoff = Backoff::new();
        while !self.shared.signal_pending(self.pid) {
            if self.shared.is_aborted() {
                halt();
            }
            backoff.snooze();
        }
        // Running must be visible before the signal slot is free again,
        // or the host could mistake the stale state for a new request.
        self.publish(SyncState::Running);
        self.shared.take_signal(self.pid, SyncState::Continue);
    }

    // ==========================================
    // Registration
    // ==========================================

    /// Registers a zero-filled region of `size` bytes. Usable locally at
    /// once, remotely from the next superstep. Collective and positional.
    pub fn register(&mut self, size: usize) -> Region {
        let region = self.registry.register(size);
        self.note_registration();
        trace!(pid = self.pid, %region, size, "register");
        region
    }

    /// Deregisters `region` at the next sync. Collective and positional.
    pub fn deregister(&mut self, region: Region) -> Result<()> {
        self.registry.deregister(region)?;
        self.note_registration();
        trace!(pid = self.pid, %region, "deregister");
        Ok(())
    }

    fn note_registration(&self) {
        self.shared.reg_calls[self.pid].store(self.registry.calls(), Ordering::Release);
        self.shared.reg_dirty.store(true, Ordering::Release);
    }

    pub fn region(&self, region: Region) -> Result<&[u8]> {
        self.registry.local(region)
    }

    pub fn region_mut(&mut self, region: Region) -> Result<&mut [u8]> {
        self.registry.local_mut(region)
    }

    // ==========================================
    // One-sided communication
    // ==========================================

    /// Writes `src` into `region` of core `pid` at `offset`, at the next
    /// sync. `src` is captured now.
    pub fn put(&self, pid: usize, src: &[u8], region: Region, offset: usize) -> Result<()> {
        self.shared.check_pid(pid)?;
        self.registry.check_remote(region)?;
        self.shared.requests[pid].lock().push(Request::Put {
            dst: region,
            offset,
            payload: src.to_vec(),
        })?;
        trace!(from = self.pid, to = pid, %region, offset, len = src.len(), "put");
        Ok(())
    }

    /// Copies `len` bytes of `src` on core `pid` into our own `dst` region,
    /// at the next sync. Observes the value `src` holds when the sync
    /// starts, never a put of the same superstep.
    pub fn get(
        &self,
        pid: usize,
        src: Region,
        src_offset: usize,
        dst: Region,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.shared.check_pid(pid)?;
        self.registry.check_remote(src)?;
        let local = self.registry.local(dst)?;
        span(dst_offset, len, local.len())?;
        self.shared.requests[pid].lock().push(Request::Get {
            requester: self.pid,
            src,
            src_offset,
            dst,
            dst_offset,
            len,
        })?;
        trace!(from = self.pid, to = pid, %src, src_offset, len, "get");
        Ok(())
    }

    // ==========================================
    // Message passing
    // ==========================================

    /// Queues a tagged message for core `pid`, readable there from the
    /// next superstep.
    pub fn send(&self, pid: usize, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.shared.check_pid(pid)?;
        self.check_tag(tag)?;
        self.shared.queues[pid][self.queue_index ^ 1]
            .lock()
            .push(Message::new(tag, payload))?;
        trace!(from = self.pid, to = pid, len = payload.len(), "send");
        Ok(())
    }

    /// Sends a tagged message to the host.
    pub fn send_up(&self, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.check_tag(tag)?;
        self.shared.outbox[self.pid].lock().push(Message::new(tag, payload));
        Ok(())
    }

    fn check_tag(&self, tag: &[u8]) -> Result<()> {
        if tag.len() != self.tagsize {
            return Err(BspError::TagSizeMismatch { expected: self.tagsize, got: tag.len() });
        }
        Ok(())
    }

    pub fn tagsize(&self) -> usize {
        self.tagsize
    }

    /// Sets the tag size from the next superstep on; returns the previously
    /// pending value.
    pub fn set_tagsize(&mut self, tagsize: usize) -> usize {
        std::mem::replace(&mut self.tagsize_next, tagsize)
    }

    fn readable(&self) -> &SpinLock<MessageQueue> {
        &self.shared.queues[self.pid][self.queue_index]
    }

    /// (messages, payload bytes) not consumed yet this superstep.
    pub fn queue_size(&self) -> (usize, usize) {
        self.readable().lock().remaining(self.read_cursor)
    }

    /// Tag and payload length of the next message.
    pub fn peek_tag(&self) -> Option<(Vec<u8>, usize)> {
        self.readable()
            .lock()
            .get(self.read_cursor)
            .map(|message| (message.tag.clone(), message.payload.len()))
    }

    /// Copies the next payload into `dst`, truncated to its length, and
    /// moves past it. Returns the number of bytes copied.
    pub fn consume(&mut self, dst: &mut [u8]) -> Option<usize> {
        let copied = {
            let queue = self.readable().lock();
            let message = queue.get(self.read_cursor)?;
            let n = message.payload.len().min(dst.len());
            dst[..n].copy_from_slice(&message.payload[..n]);
            n
        };
        self.read_cursor += 1;
        Some(copied)
    }

    pub fn consume_message(&mut self) -> Option<Message> {
        let message = self.readable().lock().get(self.read_cursor).cloned()?;
        self.read_cursor += 1;
        Some(message)
    }

    // ==========================================
    // External memory
    // ==========================================

    pub fn allocate(&self, size: usize) -> Result<ExtPtr> {
        let result = self.shared.allocator.lock().allocate(size);
        match &result {
            Ok(ptr) => trace!(pid = self.pid, offset = ptr.offset(), size, "ext allocate"),
            Err(err) => debug!(pid = self.pid, size, %err, "ext allocate failed"),
        }
        result
    }

    pub fn free(&self, ptr: ExtPtr) -> Result<()> {
        self.shared.allocator.lock().free(ptr)
    }

    /// Writes into an external block.
    ///
    /// # Safety
    /// No other core may access the same bytes before the next sync.
    pub unsafe fn ext_write(&self, ptr: ExtPtr, offset: usize, src: &[u8]) -> Result<()> {
        let len = self.shared.allocator.lock().accessible_len(ptr)?;
        let range = span(offset, src.len(), len)?;
        self.shared.ext.write(ptr.offset() + range.start, src)
    }

    /// Reads from an external block.
    ///
    /// # Safety
    /// No other core may write the same bytes before the next sync.
    pub unsafe fn ext_read(&self, ptr: ExtPtr, offset: usize, dst: &mut [u8]) -> Result<()> {
        let len = self.shared.allocator.lock().accessible_len(ptr)?;
        let range = span(offset, dst.len(), len)?;
        self.shared.ext.read(ptr.offset() + range.start, dst)
    }

    // ==========================================
    // Diagnostics
    // ==========================================

    /// Sends a message to the host and waits until it has been taken.
    pub fn log(&self, args: fmt::Arguments<'_>) {
        let text = format_bounded(args);
        trace!(pid = self.pid, %text, "log");
        self.shared.diag.post(self.pid, &text);
    }

    /// Reports `args` to the host, stops every core and halts this one.
    pub fn abort(&self, args: fmt::Arguments<'_>) -> ! {
        let text = format_bounded(args);
        warn!(pid = self.pid, %text, "abort");
        self.shared.abort_core(self.pid, &text);
        halt()
    }
}
