use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use lockstep_core::{SharedBlock, SyncState};
use tracing::{debug, error, info};

use crate::worker::panic_message;
use crate::Diagnostic;

pub(crate) type SyncHook = Box<dyn FnMut(&SharedBlock, usize)>;

/// Host-side poll loop over the shared block.
///
/// Each pass refreshes the host timer, drains the diagnostic slot and
/// answers the start and host-sync handshakes. It never blocks.
pub(crate) struct Monitor<'a> {
    shared: &'a SharedBlock,
    started: Instant,
    on_sync: Option<SyncHook>,
    released: bool,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) host_syncs: usize,
    /// Panic message of the sync hook, if it failed.
    pub(crate) hook_failure: Option<String>,
}

impl<'a> Monitor<'a> {
    pub(crate) fn new(shared: &'a SharedBlock, on_sync: Option<SyncHook>) -> Self {
        Self {
            shared,
            started: Instant::now(),
            on_sync,
            released: !shared.config().wait_for_host,
            diagnostics: Vec::new(),
            host_syncs: 0,
            hook_failure: None,
        }
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Polls until `done` holds, then once more.
    pub(crate) fn drain_until(&mut self, mut done: impl FnMut() -> bool) {
        while !done() {
            self.poll();
            thread::yield_now();
        }
        self.poll();
    }

    pub(crate) fn poll(&mut self) {
        self.shared.set_host_time(self.started.elapsed().as_secs_f32());
        self.drain_diagnostic();
        if self.shared.is_aborted() {
            // No handshake may release a core once the run is stopping.
            return;
        }

        if !self.released {
            if self.shared.states().iter().all(|&s| s == SyncState::Ready) {
                debug!("all cores ready, releasing");
                self.release_all();
                self.released = true;
            }
        } else if self.all_parked() {
            self.serve_host_sync();
        }
    }

    fn serve_host_sync(&mut self) {
        let round = self.host_syncs;
        if let Some(hook) = self.on_sync.as_mut() {
            let shared = self.shared;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(shared, round))) {
                let message = panic_message(payload.as_ref());
                error!(round, %message, "host sync hook panicked, aborting run");
                self.on_sync = None;
                self.hook_failure = Some(message);
                // Parked cores see the abort and halt instead of waiting
                // for a Continue that never comes.
                self.shared.abort_from_host();
                return;
            }
        }
        debug!(round, "host sync");
        self.host_syncs += 1;
        self.release_all();
    }

    fn drain_diagnostic(&mut self) {
        if let Some((pid, text)) = self.shared.diagnostics().try_take() {
            info!("[core {pid}] {text}");
            self.diagnostics.push(Diagnostic { pid, text });
        }
    }

    // Every core waits in AtSync and none still holds an earlier Continue.
    // Signals are read before states: a core publishes Running before it
    // clears its signal, so once every slot reads empty the states loaded
    // afterwards are no older than that wake-up.
    fn all_parked(&self) -> bool {
        (0..self.shared.nprocs()).all(|pid| !self.shared.signal_pending(pid))
            && self.shared.states().iter().all(|&s| s == SyncState::AtSync)
    }

    fn release_all(&self) {
        for pid in 0..self.shared.nprocs() {
            self.shared.signal(pid, SyncState::Continue);
        }
    }
}
