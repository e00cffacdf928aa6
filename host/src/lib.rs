//! Host side of a lockstep run: spawns one thread per core, polls the
//! shared block while they run and collects what they reported.

mod monitor;
pub mod worker;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lockstep_core::{Config, Core, Message, SharedBlock, SyncState};
use tracing::{debug, error, info};

use crate::monitor::Monitor;
pub use crate::worker::CoreExit;

/// How the run as a whole ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// `pid` is the first core that aborted, if one was recorded.
    Aborted { pid: Option<usize> },
}

/// One line a core sent through `log` or `abort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub pid: usize,
    pub text: String,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    /// In the order the host received them.
    pub diagnostics: Vec<Diagnostic>,
    /// `send_up` messages, indexed by pid.
    pub outbox: Vec<Vec<Message>>,
    pub states: Vec<SyncState>,
    pub exits: Vec<CoreExit>,
    pub registration_counter: u32,
    pub host_syncs: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Finished
    }

    pub fn diagnostics_from(&self, pid: usize) -> impl Iterator<Item = &str> {
        self.diagnostics
            .iter()
            .filter(move |d| d.pid == pid)
            .map(|d| d.text.as_str())
    }
}

pub struct Host {
    shared: Arc<SharedBlock>,
    on_sync: Option<Box<dyn FnMut(&SharedBlock, usize)>>,
}

impl Host {
    pub fn new(config: Config) -> Result<Self> {
        let nprocs = config.nprocs;
        let shared = SharedBlock::new(config)
            .with_context(|| format!("failed to set up shared block for {nprocs} cores"))?;
        Ok(Self {
            shared: Arc::new(shared),
            on_sync: None,
        })
    }

    pub fn nprocs(&self) -> usize {
        self.shared.nprocs()
    }

    pub fn shared(&self) -> &SharedBlock {
        &self.shared
    }

    /// Tag size the cores start with.
    pub fn set_tagsize(&mut self, tagsize: usize) {
        self.shared.set_initial_tagsize(tagsize);
    }

    /// Queues a message that core `pid` reads in its first superstep.
    pub fn send_message(&mut self, pid: usize, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.shared
            .push_initial_message(pid, Message::new(tag, payload))
            .with_context(|| format!("failed to queue initial message for core {pid}"))
    }

    /// Runs `hook` each time every core is parked in `host_sync`. The second
    /// argument counts host syncs from zero. A panicking hook aborts the run
    /// and makes [`Host::spmd`] return an error.
    pub fn on_sync<H>(&mut self, hook: H)
    where
        H: FnMut(&SharedBlock, usize) + 'static,
    {
        self.on_sync = Some(Box::new(hook));
    }

    /// Runs `program` on every core and returns once all of them stopped.
    ///
    /// An aborted run is still `Ok`; check [`RunReport::outcome`].
    pub fn spmd<F>(self, program: F) -> Result<RunReport>
    where
        F: Fn(&mut Core) + Sync,
    {
        let Host { shared, on_sync } = self;
        let nprocs = shared.nprocs();
        info!(nprocs, "starting run");

        let mut monitor = Monitor::new(&shared, on_sync);
        let program = &program;

        let exits = thread::scope(|scope| -> Result<Vec<CoreExit>> {
            let mut handles = Vec::with_capacity(nprocs);
            for pid in 0..nprocs {
                let core_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("core-{pid}"))
                    .spawn_scoped(scope, move || worker::run_core(core_shared, pid, program));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        // Cores already running would wait at the first
                        // barrier forever.
                        error!(pid, %err, "failed to spawn core thread");
                        shared.raise_abort(pid);
                        monitor.drain_until(|| handles.iter().all(|h| h.is_finished()));
                        return Err(err).with_context(|| format!("failed to spawn core {pid}"));
                    }
                }
            }

            monitor.drain_until(|| handles.iter().all(|h| h.is_finished()));

            Ok(handles
                .into_iter()
                .enumerate()
                .map(|(pid, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        CoreExit::Panicked(format!("core {pid} thread could not be joined"))
                    })
                })
                .collect())
        })?;

        if let Some(message) = monitor.hook_failure.take() {
            bail!("host sync hook panicked after {} rounds: {message}", monitor.host_syncs);
        }

        let outcome = if shared.is_aborted() {
            Outcome::Aborted { pid: shared.aborted_by() }
        } else {
            Outcome::Finished
        };
        let report = RunReport {
            outcome,
            outbox: (0..nprocs).map(|pid| shared.take_outbox(pid)).collect(),
            states: shared.states(),
            exits,
            registration_counter: shared.registration_counter(),
            host_syncs: monitor.host_syncs,
            elapsed: monitor.started().elapsed(),
            diagnostics: std::mem::take(&mut monitor.diagnostics),
        };

        match report.outcome {
            Outcome::Finished => info!(elapsed = ?report.elapsed, "run finished"),
            Outcome::Aborted { pid } => info!(?pid, elapsed = ?report.elapsed, "run aborted"),
        }
        debug!(states = ?report.states, "final core states");
        Ok(report)
    }
}
