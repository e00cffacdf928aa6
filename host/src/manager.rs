use anyhow::{bail, Result};
use lockstep_core::{bsp_abort, bsp_log, Config, Core};
use lockstep_host::{Host, Outcome};
use tracing::info;

const TAG_SIZE: usize = 4;

// Demo run: every core greets the host, then the cores sum pid + 1 into
// core 0 and core 0 stages the total in external memory before sending
// it up.
pub fn run_demo(nprocs: usize) -> Result<()> {
    let mut host = Host::new(Config::new(nprocs).with_tagsize(TAG_SIZE))?;
    for pid in 0..nprocs {
        host.send_message(pid, &(pid as u32).to_le_bytes(), b"start")?;
    }
    host.on_sync(|shared, round| {
        let cores = 0..shared.nprocs();
        let requests: usize = cores.clone().map(|pid| shared.pending_requests(pid)).sum();
        let messages: usize = cores.map(|pid| shared.pending_messages(pid).0).sum();
        info!(round, host_time = shared.host_time(), requests, messages, "all cores parked at host sync");
    });

    let report = host.spmd(sum_program)?;

    for (pid, messages) in report.outbox.iter().enumerate() {
        for message in messages {
            if let Ok(bytes) = <[u8; 4]>::try_from(message.payload.as_slice()) {
                info!(pid, total = f32::from_le_bytes(bytes), "result");
            }
        }
    }
    info!(
        supersteps_with_registration = report.registration_counter,
        host_syncs = report.host_syncs,
        elapsed = ?report.elapsed,
        "demo complete"
    );

    match report.outcome {
        Outcome::Finished => Ok(()),
        Outcome::Aborted { pid } => bail!("demo run aborted by core {pid:?}"),
    }
}

fn sum_program(core: &mut Core) {
    let pid = core.pid();
    let p = core.nprocs();

    while let Some(message) = core.consume_message() {
        bsp_log!(core, "core {pid} received {:?}", String::from_utf8_lossy(&message.payload));
    }

    let slots = core.register(p * 4);
    core.sync();

    let value = pid as f32 + 1.0;
    if let Err(err) = core.put(0, &value.to_le_bytes(), slots, pid * 4) {
        bsp_abort!(core, "put failed: {err}");
    }
    core.sync();

    if pid == 0 {
        let total = match core.region(slots) {
            Ok(bytes) => bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .sum::<f32>(),
            Err(err) => bsp_abort!(core, "reading sums: {err}"),
        };
        stage_and_send(core, total);
    }

    core.host_sync();
    if let Err(err) = core.deregister(slots) {
        bsp_abort!(core, "deregister failed: {err}");
    }
    core.sync();
}

fn stage_and_send(core: &Core, total: f32) {
    let block = match core.allocate(4) {
        Ok(block) => block,
        Err(err) => bsp_abort!(core, "allocate failed: {err}"),
    };
    let mut staged = [0u8; 4];
    // SAFETY: only core 0 touches this block and frees it below.
    let copied = unsafe {
        core.ext_write(block, 0, &total.to_le_bytes())
            .and_then(|()| core.ext_read(block, 0, &mut staged))
    };
    if let Err(err) = copied.and_then(|()| core.free(block)) {
        bsp_abort!(core, "external memory: {err}");
    }
    if let Err(err) = core.send_up(&0u32.to_le_bytes(), &staged) {
        bsp_abort!(core, "send_up failed: {err}");
    }
    bsp_log!(core, "sum over {} cores is {}", core.nprocs(), f32::from_le_bytes(staged));
}
