use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use lockstep_core::{Core, Halted, SharedBlock};
use tracing::{debug, warn};

/// How a core thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreExit {
    /// The program returned and the core published Finished.
    Finished,
    /// Stopped by an abort, its own or another core's.
    Halted,
    /// The program panicked; treated as an abort of this core.
    Panicked(String),
    /// `Core::begin` refused to start.
    Failed(String),
}

/// Body of one core thread: begin, run the program, end.
pub(crate) fn run_core<F>(shared: Arc<SharedBlock>, pid: usize, program: &F) -> CoreExit
where
    F: Fn(&mut Core) + Sync,
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut core = Core::begin(shared.clone(), pid)?;
        program(&mut core);
        core.end();
        Ok::<_, lockstep_core::BspError>(())
    }));

    match result {
        Ok(Ok(())) => CoreExit::Finished,
        Ok(Err(err)) => {
            let text = format!("core {pid} failed to start: {err}");
            warn!(pid, %err, "core failed to start");
            shared.abort_core(pid, &text);
            CoreExit::Failed(text)
        }
        Err(payload) if payload.is::<Halted>() => {
            debug!(pid, "core halted");
            CoreExit::Halted
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(pid, %message, "core program panicked");
            shared.abort_core(pid, &format!("core {pid} panicked: {message}"));
            CoreExit::Panicked(message)
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
