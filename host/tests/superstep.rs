use lockstep_core::{BspError, Config, Core};
use lockstep_host::{CoreExit, Host, Outcome, RunReport};

fn run<F>(config: Config, program: F) -> RunReport
where
    F: Fn(&mut Core) + Sync,
{
    let report = Host::new(config.with_ext_memory(64 * 1024))
        .unwrap()
        .spmd(program)
        .unwrap();
    assert!(report.is_success(), "run failed: {report:?}");
    report
}

fn read_f32(bytes: &[u8]) -> f32 {
    f32::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn sum_of_four_cores_lands_on_core_zero() {
    let report = run(Config::new(4), |core| {
        let p = core.nprocs();
        let slots = core.register(p * 4);
        core.sync();

        let value = core.pid() as f32 + 1.0;
        core.put(0, &value.to_le_bytes(), slots, core.pid() * 4).unwrap();
        core.sync();

        if core.pid() == 0 {
            let total: f32 = core.region(slots).unwrap().chunks_exact(4).map(read_f32).sum();
            core.send_up(&[], &total.to_le_bytes()).unwrap();
        }
    });

    assert_eq!(report.outbox[0].len(), 1);
    assert_eq!(read_f32(&report.outbox[0][0].payload), 10.0);
    assert!(report.outbox[1..].iter().all(Vec::is_empty));
}

#[test]
fn get_never_observes_a_put_of_the_same_superstep() {
    run(Config::new(2), |core| {
        let shared = core.register(4);
        let landing = core.register(4);
        let fill = core.pid() as u8 + 1;
        core.region_mut(shared).unwrap().fill(fill);
        core.sync();

        if core.pid() == 0 {
            core.put(1, &[99; 4], shared, 0).unwrap();
            core.get(1, shared, 0, landing, 0, 4).unwrap();
        }
        core.sync();

        match core.pid() {
            0 => assert_eq!(core.region(landing).unwrap(), &[2; 4]),
            _ => assert_eq!(core.region(shared).unwrap(), &[99; 4]),
        }
    });
}

#[test]
fn put_source_is_captured_at_call_time() {
    run(Config::new(2), |core| {
        let region = core.register(4);
        core.sync();

        if core.pid() == 1 {
            let mut src = [7u8; 4];
            core.put(0, &src, region, 0).unwrap();
            src.fill(0);
            assert_eq!(src, [0; 4]);
        }
        core.sync();

        if core.pid() == 0 {
            assert_eq!(core.region(region).unwrap(), &[7; 4]);
        }
    });
}

#[test]
fn later_puts_to_the_same_bytes_win() {
    run(Config::new(3), |core| {
        let region = core.register(2);
        core.sync();

        if core.pid() == 2 {
            core.put(0, &[1, 1], region, 0).unwrap();
            core.put(0, &[2], region, 1).unwrap();
        }
        core.sync();

        if core.pid() == 0 {
            assert_eq!(core.region(region).unwrap(), &[1, 2]);
        }
    });
}

#[test]
fn regions_become_remote_targets_after_sync() {
    run(Config::new(2), |core| {
        let region = core.register(8);
        // Locally usable at once.
        core.region_mut(region).unwrap()[0] = 5;
        let peer = 1 - core.pid();
        assert!(matches!(core.put(peer, &[1], region, 0), Err(BspError::InvalidRegion(r)) if r == region));
        core.sync();

        core.put(peer, &[1], region, 1).unwrap();
        core.sync();
        assert_eq!(&core.region(region).unwrap()[..2], &[5, 1]);
    });
}

#[test]
fn deregistered_region_disappears_after_sync() {
    run(Config::new(2), |core| {
        let region = core.register(4);
        core.sync();

        core.deregister(region).unwrap();
        // Still valid until the sync that commits the deregistration.
        assert!(core.region(region).is_ok());
        core.put(1 - core.pid(), &[3; 4], region, 0).unwrap();
        core.sync();

        assert!(matches!(core.region(region), Err(BspError::InvalidRegion(_))));
        assert!(matches!(core.deregister(region), Err(BspError::InvalidRegion(_))));
    });
}

#[test]
fn invalid_pids_are_rejected() {
    run(Config::new(2), |core| {
        let region = core.register(4);
        core.sync();
        assert!(matches!(core.put(2, &[0], region, 0), Err(BspError::InvalidPid { pid: 2, nprocs: 2 })));
        assert!(matches!(core.send(5, &[], b"x"), Err(BspError::InvalidPid { pid: 5, .. })));
        assert!(matches!(
            core.get(1 - core.pid(), region, 0, region, 2, 4),
            Err(BspError::OutOfBounds { offset: 2, len: 4, size: 4 })
        ));
    });
}

#[test]
fn request_partition_overflow_is_reported() {
    let config = Config::new(2).with_request_capacity(2, 1024);
    run(config, |core| {
        let region = core.register(4);
        core.sync();

        if core.pid() == 0 {
            core.put(1, &[1], region, 0).unwrap();
            core.put(1, &[2], region, 1).unwrap();
            assert!(matches!(
                core.put(1, &[3], region, 2),
                Err(BspError::CapacityExceeded { what: "request", capacity: 2 })
            ));
        }
        core.sync();

        if core.pid() == 1 {
            assert_eq!(core.region(region).unwrap(), &[1, 2, 0, 0]);
        }
    });
}

#[test]
fn registration_counter_counts_supersteps_with_calls() {
    let report = run(Config::new(3), |core| {
        let a = core.register(4);
        let b = core.register(4);
        core.sync();
        core.sync();
        core.deregister(a).unwrap();
        core.sync();
        core.deregister(b).unwrap();
        core.sync();
    });
    assert_eq!(report.registration_counter, 3);
}

#[test]
fn superstep_counter_and_timers_advance() {
    run(Config::new(2), |core| {
        assert_eq!(core.superstep(), 0);
        core.sync();
        core.sync();
        assert_eq!(core.superstep(), 2);
        assert!(core.time() >= 0.0);
        assert!(core.host_time() >= 0.0);
    });
}

#[test]
fn get_length_counts_against_the_request_budget() {
    let config = Config::new(2).with_request_capacity(16, 8);
    run(config, |core| {
        let region = core.register(16);
        core.sync();

        if core.pid() == 0 {
            core.get(1, region, 0, region, 0, 8).unwrap();
            assert!(matches!(
                core.get(1, region, 8, region, 8, 8),
                Err(BspError::CapacityExceeded { what: "request payload", capacity: 8 })
            ));
        }
        core.sync();
    });
}

// Region #0 is 4 bytes on core 0 and 16 bytes everywhere else.
fn mismatched_region(core: &mut Core) -> lockstep_core::Region {
    let region = core.register(if core.pid() == 0 { 4 } else { 16 });
    core.sync();
    region
}

#[test]
fn put_overrunning_the_owner_region_aborts() {
    let report = Host::new(Config::new(3).with_ext_memory(64 * 1024))
        .unwrap()
        .spmd(|core| {
            let region = mismatched_region(core);
            if core.pid() == 1 {
                // Fits the sender's copy of the region, not the owner's.
                core.put(0, &[9; 8], region, 0).unwrap();
            }
            core.sync();
            unreachable!("core {} passed an aborted sync", core.pid());
        })
        .unwrap();

    assert_eq!(report.outcome, Outcome::Aborted { pid: Some(0) });
    let text: Vec<_> = report.diagnostics_from(0).collect();
    assert_eq!(text.len(), 1);
    assert!(text[0].starts_with("put into core 0"), "{text:?}");
    assert_eq!(report.exits, vec![CoreExit::Halted; 3]);
}

#[test]
fn get_beyond_the_owner_region_aborts() {
    let report = Host::new(Config::new(2).with_ext_memory(64 * 1024))
        .unwrap()
        .spmd(|core| {
            let region = mismatched_region(core);
            if core.pid() == 1 {
                core.get(0, region, 0, region, 8, 8).unwrap();
            }
            core.sync();
            unreachable!("core {} passed an aborted sync", core.pid());
        })
        .unwrap();

    assert_eq!(report.outcome, Outcome::Aborted { pid: Some(0) });
    let text: Vec<_> = report.diagnostics_from(0).collect();
    assert_eq!(text.len(), 1);
    assert!(text[0].starts_with("get by core 1 from core 0"), "{text:?}");
    assert_eq!(report.exits, vec![CoreExit::Halted; 2]);
}
