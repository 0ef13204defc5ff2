// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use cachemig::fleet::SocketKey;
use cachemig::fleet::VmState;
use cachemig::sim::SimAction;
use cachemig::sim::SimHypervisor;
use cachemig::stats::CycleStats;
use cachemig::SchedState;
use cachemig::Scheduler;
use cachemig::Tunables;

/// With a million retired instructions the miss rate is misses / 50.
const RETIRED: u64 = 1_000_000;

fn misses_for(rate: u64) -> u64 {
    rate * 50
}

fn fast_tunables() -> Tunables {
    Tunables {
        nr_nodes: 2,
        vms_per_node: 1,
        degree_of_migration: 1,
        numa_threshold: 1e12,
        swap_patience: 100,
        local_interval: 0.01,
        global_interval: 0.01,
        shutdown_grace: 2.0,
        ..Default::default()
    }
}

fn wait_for(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn wait_cycles(state: &SchedState, n: usize) -> Vec<CycleStats> {
    wait_for("cycles", || state.stats.cycles().len() >= n);
    state.stats.cycles()
}

fn start(tunables: Tunables, sim: &Arc<SimHypervisor>, nr_hosts: u32) -> Scheduler {
    let shutdown = Arc::new(AtomicBool::new(false));
    Scheduler::init(tunables, sim.clone(), nr_hosts, shutdown).unwrap()
}

/// 2 hosts x 2 nodes, one VM per node, pressure given per socket.
fn two_by_two(pressure: [u64; 4]) -> Arc<SimHypervisor> {
    let sim = Arc::new(SimHypervisor::uniform(2, 2, 1));
    let names = ["vm-1-0-0", "vm-1-1-0", "vm-2-0-0", "vm-2-1-0"];
    for (name, rate) in names.iter().zip(pressure) {
        sim.set_counters(name, RETIRED, misses_for(rate));
    }
    sim
}

#[test]
fn test_swaps_most_and_least_pressured_sockets() {
    let sim = two_by_two([3000, 100, 200, 2900]);
    let sched = start(fast_tunables(), &sim, 2);
    let cycles = wait_cycles(sched.state(), 3);

    let first = &cycles[0];
    assert_eq!(first.generation, 1);
    assert_eq!(first.pressure.len(), 4);
    assert_eq!(first.pressure[&SocketKey::new(1, 0)], 3000.0);
    assert_eq!(first.swaps.len(), 1);
    assert_eq!(first.swaps[0].high, SocketKey::new(1, 0));
    assert_eq!(first.swaps[0].low, SocketKey::new(1, 1));
    assert_eq!(first.migrations_issued, 2);
    assert_eq!(first.migrations_failed, 0);

    // The same two VMs now look like the reverse imbalance.
    for cycle in cycles[1..3].iter() {
        assert!(cycle.swaps.is_empty());
        assert_eq!(cycle.rejected.get("hysteresis"), Some(&1));
    }

    let state = sched.state().clone();
    sched.shutdown().unwrap();

    let migrations = sim.migrations();
    assert_eq!(migrations.len(), 2);
    for action in migrations {
        match action {
            SimAction::Migrate {
                src,
                dest,
                numa_local,
                ..
            } => {
                assert_eq!((src, dest), (1, 1));
                assert!(numa_local);
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(sim.placement("vm-1-0-0").map(|p| p.1), Some(1));
    assert_eq!(sim.placement("vm-1-1-0").map(|p| p.1), Some(0));

    let hot = state.registry.snapshot(0).unwrap();
    assert_eq!(hot.cpu_affinity, 1);
    assert_eq!(hot.state, VmState::Running);
    assert_eq!(hot.local_id, sim.placement("vm-1-0-0").map(|p| p.2));
    state.registry.check_invariants().unwrap();
}

#[test]
fn test_degree_two_uses_disjoint_sockets() {
    let sim = two_by_two([3000, 100, 2500, 200]);
    let tunables = Tunables {
        degree_of_migration: 2,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 2);
    let cycles = wait_cycles(sched.state(), 2);
    let state = sched.state().clone();
    sched.shutdown().unwrap();

    let first = &cycles[0];
    assert_eq!(first.swaps.len(), 2);
    assert_eq!(first.migrations_issued, 4);
    let mut sockets: Vec<SocketKey> = first
        .swaps
        .iter()
        .flat_map(|s| [s.high, s.low])
        .collect();
    sockets.sort();
    sockets.dedup();
    assert_eq!(sockets.len(), 4);

    assert_eq!(sim.migrations().len(), 4);
    assert_eq!(sim.placement("vm-2-0-0").map(|p| p.1), Some(1));
    state.registry.check_invariants().unwrap();
}

#[test]
fn test_cross_host_swap() {
    let sim = two_by_two([3000, 2900, 150, 100]);
    let tunables = Tunables {
        degree_of_migration: 1,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 2);
    let cycles = wait_cycles(sched.state(), 1);
    let state = sched.state().clone();
    sched.shutdown().unwrap();

    assert_eq!(cycles[0].swaps[0].high, SocketKey::new(1, 0));
    assert_eq!(cycles[0].swaps[0].low, SocketKey::new(2, 1));

    // vm-1-0-0 went to host 2 node 1, vm-2-1-0 to host 1 node 0.
    assert_eq!(sim.placement("vm-1-0-0").map(|p| (p.0, p.1)), Some((2, 1)));
    assert_eq!(sim.placement("vm-2-1-0").map(|p| (p.0, p.1)), Some((1, 0)));
    assert!(sim.migrations().iter().all(|a| matches!(
        a,
        SimAction::Migrate {
            numa_local: false,
            ..
        }
    )));
    assert_eq!(state.registry.host_vms(1), vec![1, 3]);
    assert_eq!(state.registry.snapshot(0).map(|vm| vm.host), Some(2));
    state.registry.check_invariants().unwrap();
}

#[test]
fn test_lost_local_id_is_looked_up_again() {
    let sim = two_by_two([3000, 2900, 150, 100]);
    sim.fail_lookups("vm-1-0-0", 1);
    let sched = start(fast_tunables(), &sim, 2);
    let cycles = wait_cycles(sched.state(), 4);
    let state = sched.state().clone();
    sched.shutdown().unwrap();

    // The move itself went through, only the id lookup after it failed.
    assert_eq!(cycles[0].migrations_issued, 2);
    assert_eq!(cycles[0].migrations_failed, 1);
    assert_eq!(sim.placement("vm-1-0-0").map(|p| (p.0, p.1)), Some((2, 1)));

    // Host 2 still reports both of its VMs, so the reverse pair is held
    // back instead of losing track of vm-1-0-0.
    for cycle in cycles[1..4].iter() {
        assert_eq!(cycle.rejected.get("missing_vm"), None);
        assert_eq!(cycle.rejected.get("hysteresis"), Some(&1));
    }
    let vm = state.registry.snapshot(0).unwrap();
    assert_eq!(vm.host, 2);
    assert_eq!(vm.local_id, sim.placement("vm-1-0-0").map(|p| p.2));
    state.registry.check_invariants().unwrap();
}

#[test]
fn test_small_gap_is_not_swapped() {
    let sim = two_by_two([1500, 600, 700, 800]);
    let sched = start(fast_tunables(), &sim, 2);
    let cycles = wait_cycles(sched.state(), 2);
    sched.shutdown().unwrap();

    for cycle in cycles.iter() {
        assert!(cycle.swaps.is_empty());
        assert_eq!(cycle.rejected.get("below_threshold"), Some(&1));
    }
    assert!(sim.migrations().is_empty());
}

#[test]
fn test_failed_migration_still_completes_cycle() {
    let sim = two_by_two([3000, 100, 200, 2900]);
    sim.fail_actions_for("vm-1-0-0");
    let sched = start(fast_tunables(), &sim, 2);
    let cycles = wait_cycles(sched.state(), 2);
    let state = sched.state().clone();
    sched.shutdown().unwrap();

    assert_eq!(cycles[0].migrations_issued, 2);
    assert_eq!(cycles[0].migrations_failed, 1);

    // The failed VM keeps its recorded placement.
    let vm = state.registry.snapshot(0).unwrap();
    assert_eq!((vm.host, vm.cpu_affinity, vm.state), (1, 0, VmState::Running));
    assert_eq!(state.migrations.outstanding(), 0);
    state.registry.check_invariants().unwrap();
}

#[test]
fn test_failed_sample_rejects_pairs_of_that_host() {
    let sim = two_by_two([0, 0, 3000, 100]);
    sim.fail_sampling(1, true);
    let sched = start(fast_tunables(), &sim, 2);
    let cycles = wait_cycles(sched.state(), 2);
    sched.shutdown().unwrap();

    for cycle in cycles.iter() {
        assert_eq!(cycle.pressure.len(), 4);
        assert_eq!(cycle.pressure[&SocketKey::new(1, 0)], 0.0);
        assert!(cycle.swaps.is_empty());
        assert_eq!(cycle.rejected.get("missing_vm"), Some(&1));
    }
    assert!(sim.migrations().is_empty());
}

#[test]
fn test_numa_pass_migrates_in_place() {
    let sim = Arc::new(SimHypervisor::uniform(1, 2, 1));
    sim.set_counters("vm-1-0-0", RETIRED, misses_for(3000));
    sim.set_pages("vm-1-0-0", vec![100_000, 162_144]);
    let tunables = Tunables {
        numa_threshold: 2000.0,
        numa_period: 1,
        global_llc_threshold: 1e12,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 1);
    let state = sched.state().clone();

    wait_for("NUMA migration", || !sim.migrations().is_empty());
    wait_cycles(&state, 3);
    sched.shutdown().unwrap();

    let migrations = sim.migrations();
    assert_eq!(
        migrations,
        vec![SimAction::Migrate {
            src: 1,
            dest: 1,
            name: "vm-1-0-0".to_string(),
            numa_local: true,
        }]
    );
    assert_eq!(
        state.registry.snapshot(0).and_then(|vm| vm.local_id),
        sim.placement("vm-1-0-0").map(|p| p.2)
    );
}

#[test]
fn test_local_balance_spreads_hot_vms() {
    let sim = Arc::new(SimHypervisor::uniform(1, 2, 2));
    sim.set_counters("vm-1-0-0", RETIRED, misses_for(3000));
    sim.set_counters("vm-1-0-1", RETIRED, misses_for(2000));
    sim.set_counters("vm-1-1-0", RETIRED, misses_for(10));
    sim.set_counters("vm-1-1-1", RETIRED, misses_for(20));
    let tunables = Tunables {
        vms_per_node: 2,
        local_balance: true,
        global_llc_threshold: 1e12,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 1);
    let cycles = wait_cycles(sched.state(), 3);
    sched.shutdown().unwrap();

    let node = |name: &str| sim.placement(name).map(|p| p.1);
    assert_eq!(node("vm-1-0-0"), Some(0));
    assert_eq!(node("vm-1-0-1"), Some(1));
    assert_eq!(node("vm-1-1-1"), Some(1));
    assert_eq!(node("vm-1-1-0"), Some(0));

    // Published after the interleave: 3000 + 10 and 2000 + 20.
    assert_eq!(cycles[0].pressure[&SocketKey::new(1, 0)], 3010.0);
    assert_eq!(cycles[0].pressure[&SocketKey::new(1, 1)], 2020.0);
    let pins = sim
        .actions()
        .into_iter()
        .filter(|a| matches!(a, SimAction::Pin { .. }))
        .count();
    assert_eq!(pins, 2);
}

#[test]
fn test_affinity_drift_is_corrected() {
    let sim = Arc::new(SimHypervisor::uniform(1, 2, 1));
    let tunables = Tunables {
        verify_affinity: true,
        global_llc_threshold: 1e12,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 1);
    let state = sched.state().clone();

    wait_cycles(&state, 1);
    sim.repin_externally("vm-1-0-0", 1);
    wait_for("affinity update", || {
        state.registry.snapshot(0).map(|vm| vm.cpu_affinity) == Some(1)
    });
    sched.shutdown().unwrap();
}

#[test]
fn test_shutdown_is_bounded() {
    let sim = two_by_two([3000, 100, 200, 2900]);
    let tunables = Tunables {
        local_interval: 60.0,
        global_interval: 60.0,
        shutdown_grace: 1.0,
        ..fast_tunables()
    };
    let sched = start(tunables, &sim, 2);
    wait_cycles(sched.state(), 1);
    let state = sched.state().clone();

    let started = Instant::now();
    sched.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let migrations = sim.migrations().len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.migrations().len(), migrations);
    assert_eq!(state.migrations.queued(), 0);
}

#[test]
fn test_init_rejects_bad_setup() {
    let sim = Arc::new(SimHypervisor::uniform(1, 2, 1));
    let shutdown = Arc::new(AtomicBool::new(false));

    let bad = Tunables {
        degree_of_migration: 0,
        ..fast_tunables()
    };
    assert!(Scheduler::init(bad, sim.clone(), 1, shutdown.clone()).is_err());
    assert!(Scheduler::init(fast_tunables(), sim.clone(), 0, shutdown.clone()).is_err());

    // Host 2 has no VMs but host 1 does; discovery still succeeds.
    let sched = Scheduler::init(fast_tunables(), sim, 2, shutdown).unwrap();
    assert_eq!(sched.state().registry.len(), 2);
    sched.shutdown().unwrap();
}
