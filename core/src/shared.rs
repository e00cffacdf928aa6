//! The shared control block.
//!
//! One instance per run, created before any core starts and dropped after
//! the last one stopped. Every per-core array is indexed by pid; a core
//! only ever reads and applies its own slot, other cores only append.

use lockstep_common::SyncState;
use tracing::debug;

use crate::alloc::PoolAllocator;
use crate::barrier::SpinBarrier;
use crate::config::Config;
use crate::error::{BspError, Result};
use crate::extmem::ExternalMemory;
use crate::handshake::DiagnosticChannel;
use crate::queue::{Message, MessageQueue};
use crate::request::{Reply, RequestPartition};
use crate::spin::SpinLock;
use crate::sync::{AtomicBool, AtomicI8, AtomicU32, AtomicUsize, Ordering};

const NO_ABORTER: u32 = u32::MAX;

pub struct SharedBlock {
    config: Config,
    pub(crate) barrier: SpinBarrier,

    // Handshake
    states: Box<[AtomicI8]>,
    signals: Box<[AtomicI8]>,
    abort: AtomicBool,
    aborted_by: AtomicU32,
    host_timer: AtomicU32,
    pub(crate) diag: DiagnosticChannel,

    // Communication
    pub(crate) requests: Box<[SpinLock<RequestPartition>]>,
    pub(crate) replies: Box<[SpinLock<Vec<Reply>>]>,
    pub(crate) queues: Box<[[SpinLock<MessageQueue>; 2]]>,
    pub(crate) outbox: Box<[SpinLock<Vec<Message>>]>,
    tagsize: AtomicUsize,

    // Registration
    pub(crate) reg_calls: Box<[AtomicU32]>,
    pub(crate) reg_dirty: AtomicBool,
    reg_counter: AtomicU32,

    // External memory
    pub(crate) ext: ExternalMemory,
    pub(crate) allocator: SpinLock<PoolAllocator>,
}

impl SharedBlock {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let p = config.nprocs;

        let ext = match &config.ext_memory_path {
            Some(path) => ExternalMemory::file_backed(path, config.ext_memory_size)?,
            None => ExternalMemory::anonymous(config.ext_memory_size)?,
        };
        let queue = || SpinLock::new(MessageQueue::new(config.max_messages, config.max_message_bytes));

        debug!(nprocs = p, ext_memory = config.ext_memory_size, "shared block created");
        Ok(Self {
            barrier: SpinBarrier::new(p),
            states: (0..p).map(|_| AtomicI8::new(SyncState::Init.as_raw())).collect(),
            signals: (0..p).map(|_| AtomicI8::new(SyncState::Init.as_raw())).collect(),
            abort: AtomicBool::new(false),
            aborted_by: AtomicU32::new(NO_ABORTER),
            host_timer: AtomicU32::new(0f32.to_bits()),
            diag: DiagnosticChannel::new(),
            requests: (0..p)
                .map(|_| SpinLock::new(RequestPartition::new(config.max_requests, config.max_payload_bytes)))
                .collect(),
            replies: (0..p).map(|_| SpinLock::new(Vec::new())).collect(),
            queues: (0..p).map(|_| [queue(), queue()]).collect(),
            outbox: (0..p).map(|_| SpinLock::new(Vec::new())).collect(),
            tagsize: AtomicUsize::new(config.tagsize),
            reg_calls: (0..p).map(|_| AtomicU32::new(0)).collect(),
            reg_dirty: AtomicBool::new(false),
            reg_counter: AtomicU32::new(0),
            allocator: SpinLock::new(PoolAllocator::new(ext.len())),
            ext,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nprocs(&self) -> usize {
        self.config.nprocs
    }

    pub(crate) fn check_pid(&self, pid: usize) -> Result<()> {
        if pid < self.nprocs() {
            Ok(())
        } else {
            Err(BspError::InvalidPid { pid, nprocs: self.nprocs() })
        }
    }

    // ---------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------

    pub fn state(&self, pid: usize) -> SyncState {
        let raw = self.states[pid].load(Ordering::Acquire);
        SyncState::from_raw(raw).unwrap_or(SyncState::Init)
    }

    pub fn states(&self) -> Vec<SyncState> {
        (0..self.nprocs()).map(|pid| self.state(pid)).collect()
    }

    pub(crate) fn publish_state(&self, pid: usize, state: SyncState) {
        self.states[pid].store(state.as_raw(), Ordering::Release);
    }

    /// Host side: write the host-controlled slot of `pid`.
    pub fn signal(&self, pid: usize, state: SyncState) {
        self.signals[pid].store(state.as_raw(), Ordering::Release);
    }

    /// Whether the host signal of `pid` has not been consumed yet.
    pub fn signal_pending(&self, pid: usize) -> bool {
        self.signals[pid].load(Ordering::Acquire) != SyncState::Init.as_raw()
    }

    pub(crate) fn take_signal(&self, pid: usize, expected: SyncState) -> bool {
        self.signals[pid]
            .compare_exchange(
                expected.as_raw(),
                SyncState::Init.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Raises the abort flag. The first caller is recorded as the aborter.
    pub fn raise_abort(&self, pid: usize) {
        let _ = self.aborted_by.compare_exchange(
            NO_ABORTER,
            pid as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.abort.store(true, Ordering::Release);
    }

    /// Reports `text` for `pid`, marks it Aborted and stops every core.
    /// Blocks until the host has taken the message.
    pub fn abort_core(&self, pid: usize, text: &str) {
        self.diag.post(pid, text);
        self.publish_state(pid, SyncState::Aborted);
        self.raise_abort(pid);
    }

    /// Host side: stops every core without naming an aborting core.
    pub fn abort_from_host(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn abort_flag(&self) -> &AtomicBool {
        &self.abort
    }

    pub fn aborted_by(&self) -> Option<usize> {
        match self.aborted_by.load(Ordering::Acquire) {
            NO_ABORTER => None,
            pid => Some(pid as usize),
        }
    }

    pub fn diagnostics(&self) -> &DiagnosticChannel {
        &self.diag
    }

    pub fn host_time(&self) -> f32 {
        f32::from_bits(self.host_timer.load(Ordering::Acquire))
    }

    pub fn set_host_time(&self, seconds: f32) {
        self.host_timer.store(seconds.to_bits(), Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Communication
    // ---------------------------------------------------------------

    /// Tag size cores start with.
    pub fn initial_tagsize(&self) -> usize {
        self.tagsize.load(Ordering::Acquire)
    }

    /// Host side, before the run: change the tag size of superstep 0.
    pub fn set_initial_tagsize(&self, tagsize: usize) {
        self.tagsize.store(tagsize, Ordering::Release);
    }

    /// Host side, before the run: place a message in the queue `pid`
    /// drains during superstep 0.
    pub fn push_initial_message(&self, pid: usize, message: Message) -> Result<()> {
        self.check_pid(pid)?;
        let expected = self.initial_tagsize();
        if message.tag.len() != expected {
            return Err(BspError::TagSizeMismatch { expected, got: message.tag.len() });
        }
        self.queues[pid][0].lock().push(message)
    }

    /// Requests waiting in the partition of `pid`.
    pub fn pending_requests(&self, pid: usize) -> usize {
        self.requests[pid].lock().len()
    }

    /// (count, payload bytes) over both queues of `pid`.
    pub fn pending_messages(&self, pid: usize) -> (usize, usize) {
        self.queues[pid].iter().fold((0, 0), |(count, bytes), queue| {
            let queue = queue.lock();
            (count + queue.len(), bytes + queue.payload_bytes())
        })
    }

    /// Messages `pid` sent up to the host.
    pub fn take_outbox(&self, pid: usize) -> Vec<Message> {
        std::mem::take(&mut *self.outbox[pid].lock())
    }

    // ---------------------------------------------------------------
    // Registration & external memory
    // ---------------------------------------------------------------

    /// Supersteps that contained at least one register or deregister call.
    pub fn registration_counter(&self) -> u32 {
        self.reg_counter.load(Ordering::Acquire)
    }

    pub(crate) fn advance_registration_counter(&self) {
        self.reg_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// (live blocks, bytes still available) in the external pool.
    pub fn pool_usage(&self) -> (usize, usize) {
        let allocator = self.allocator.lock();
        (allocator.live_blocks(), allocator.available())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn block(p: usize) -> SharedBlock {
        SharedBlock::new(Config::new(p).with_ext_memory(4096)).unwrap()
    }

    #[test]
    fn fresh_block_is_idle() {
        let shared = block(3);
        assert_eq!(shared.states(), vec![SyncState::Init; 3]);
        assert!(!shared.is_aborted());
        assert_eq!(shared.aborted_by(), None);
        assert_eq!(shared.registration_counter(), 0);
        assert_eq!(shared.pool_usage(), (0, 4096));
        assert_eq!(shared.host_time(), 0.0);
        assert_eq!(shared.pending_requests(1), 0);
        assert_eq!(shared.pending_messages(2), (0, 0));
    }

    #[test]
    fn first_aborter_is_recorded() {
        let shared = block(4);
        shared.raise_abort(2);
        shared.raise_abort(1);
        assert!(shared.is_aborted());
        assert_eq!(shared.aborted_by(), Some(2));
    }

    #[test]
    fn host_abort_names_no_core() {
        let shared = block(2);
        shared.abort_from_host();
        assert!(shared.is_aborted());
        assert_eq!(shared.aborted_by(), None);
    }

    #[test]
    fn signals_are_consumed_once() {
        let shared = block(2);
        shared.signal(1, SyncState::Continue);
        assert!(shared.signal_pending(1));
        assert!(!shared.take_signal(0, SyncState::Continue));
        assert!(shared.take_signal(1, SyncState::Continue));
        assert!(!shared.take_signal(1, SyncState::Continue));
        assert!(!shared.signal_pending(1));
    }

    #[test]
    fn initial_messages_respect_tag_size() {
        let shared = SharedBlock::new(Config::new(2).with_tagsize(4).with_ext_memory(64)).unwrap();
        shared.push_initial_message(1, Message::new(7u32.to_le_bytes(), b"data".to_vec())).unwrap();
        assert!(matches!(
            shared.push_initial_message(1, Message::new(vec![1], vec![])),
            Err(BspError::TagSizeMismatch { expected: 4, got: 1 })
        ));
        assert!(matches!(
            shared.push_initial_message(2, Message::new(7u32.to_le_bytes(), vec![])),
            Err(BspError::InvalidPid { pid: 2, nprocs: 2 })
        ));
        assert_eq!(shared.pending_messages(1), (1, 4));
        assert_eq!(shared.pending_messages(0), (0, 0));
    }

    #[test]
    fn host_timer_round_trips() {
        let shared = block(1);
        shared.set_host_time(1.5);
        assert_eq!(shared.host_time(), 1.5);
    }
}
