// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Local monitors
//!
//! One monitor per host. Each cycle it:
//!
//! 1. Samples the LLC counters of every VM on the host and turns them into
//!    miss rates. VMs whose local id is unknown or missing from the sample
//!    are looked up by name first.
//!
//! 2. Sums the miss rates per node and publishes them to the pressure map.
//!    If the per-node VM counts do not match the expected topology, the
//!    sample is considered transient and nothing else happens this cycle.
//!
//! 3. Optionally spreads the host's hottest VMs over its nodes.
//!
//! 4. Ranks the VMs of each node and records the hottest and coldest one.
//!
//! 5. Every `numa_period` valid cycles, migrates the hottest VM of a node
//!    in place if it is above `numa_threshold` and has memory on other
//!    nodes.
//!
//! It then meets the other monitors at the rendezvous, the last one to
//! arrive wakes the global rebalancer, and all of them wait at their cycle
//! gate until the global rebalancer is done with the cycle.
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use ordered_float::OrderedFloat;

use crate::crew::sleep_unless_shutdown;
use crate::crew::Worker;
use crate::fleet::HostId;
use crate::fleet::NodeId;
use crate::fleet::SocketKey;
use crate::fleet::VmKey;
use crate::pressure::extremes;
use crate::pressure::rank_vms;
use crate::pressure::MissRateModel;
use crate::scheduler::SchedState;

/// Serpentine node order for `count` VMs sorted hottest first: the first
/// round goes `start, start+1, ..`, the next one back, and so on. Every node
/// gets the same number of VMs when `count` is a multiple of `nr_nodes`.
pub fn serpentine_placement(nr_nodes: u32, count: usize, start: NodeId) -> Vec<NodeId> {
    let n = nr_nodes.max(1) as usize;
    (0..count)
        .map(|i| {
            let (round, pos) = (i / n, i % n);
            let idx = if round % 2 == 0 { pos } else { n - 1 - pos };
            ((start as usize + idx) % n) as NodeId
        })
        .collect()
}

pub struct LocalMonitor {
    state: Arc<SchedState>,
    index: usize,
    host: HostId,
    generation: u64,
    valid_cycles: u64,
    model: MissRateModel,
}

impl LocalMonitor {
    pub fn new(state: Arc<SchedState>, index: usize) -> Self {
        let model = MissRateModel::from_tunables(&state.tunables);
        Self {
            state,
            index,
            host: index as HostId + 1,
            generation: 0,
            valid_cycles: 0,
            model,
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    fn nr_nodes(&self) -> usize {
        self.state.tunables.nr_nodes as usize
    }

    /// Sample the host and sort the matched VMs by node.
    fn sample(&self) -> Result<Vec<Vec<(VmKey, f64)>>> {
        let state = &self.state;
        let samples = state.hypervisor.list_resident_vms(self.host)?;
        let seen: BTreeSet<u32> = samples.iter().map(|s| s.local_id).collect();
        self.resolve_local_ids(&seen);
        let mut per_node = vec![vec![]; self.nr_nodes()];

        for sample in samples {
            let key = match state.registry.find_local(self.host, sample.local_id) {
                Some(key) => key,
                None => {
                    trace!("[{}] no VM for local id {}", self.host, sample.local_id);
                    continue;
                }
            };
            if state.tunables.verify_affinity {
                self.verify_affinity(key);
            }

            let rate = self.model.miss_rate(sample.retired_insts, sample.llc_misses);
            let node = state.registry.with_vm(key, |vm| {
                vm.retired_insts = sample.retired_insts;
                vm.llc_misses = sample.llc_misses;
                vm.miss_rate = rate;
                vm.cpu_affinity
            });
            match node.and_then(|n| per_node.get_mut(n as usize)) {
                Some(vms) => vms.push((key, rate)),
                None => warn!("[{}] VM {} is on an unknown node", self.host, key),
            }
        }
        Ok(per_node)
    }

    /// Look up the local id of every VM of this host the sample did not
    /// match. A failed lookup leaves the id unknown until the next cycle.
    fn resolve_local_ids(&self, seen: &BTreeSet<u32>) {
        let state = &self.state;
        for key in state.registry.unresolved(self.host, seen) {
            let name = match state.registry.name(key) {
                Some(name) => name,
                None => continue,
            };
            match state.hypervisor.query_local_id(self.host, name) {
                Ok(id) => {
                    state.registry.with_vm(key, |vm| {
                        if vm.local_id != Some(id) {
                            debug!("[{}] {} local id {:?} -> {}", self.host, name, vm.local_id, id);
                            vm.local_id = Some(id);
                        }
                    });
                }
                Err(e) => warn!("[{}] Failed to look up {}: {:#}", self.host, name, e),
            }
        }
    }

    fn verify_affinity(&self, key: VmKey) {
        let state = &self.state;
        let name = match state.registry.name(key) {
            Some(name) => name,
            None => return,
        };
        match state.hypervisor.query_affinity(self.host, name) {
            Ok(node) if node < state.tunables.nr_nodes => {
                state.registry.with_vm(key, |vm| {
                    if vm.cpu_affinity != node {
                        warn!(
                            "[{}] {} drifted from node {} to {}",
                            self.host, name, vm.cpu_affinity, node
                        );
                        vm.cpu_affinity = node;
                    }
                });
            }
            Ok(node) => warn!("[{}] {} reports unknown node {}", self.host, name, node),
            Err(e) => debug!("[{}] affinity of {} unknown: {:#}", self.host, name, e),
        }
    }

    fn is_valid(&self, per_node: &[Vec<(VmKey, f64)>]) -> bool {
        per_node
            .iter()
            .all(|vms| vms.len() == self.state.tunables.vms_per_node)
    }

    /// Re-pin the host's VMs so that hot ones are spread over the nodes.
    /// Returns the new per-node lists if anything was moved.
    fn interleave(&self, per_node: &[Vec<(VmKey, f64)>]) -> Option<Vec<Vec<(VmKey, f64)>>> {
        let state = &self.state;
        let tunables = &state.tunables;

        let sums: Vec<f64> = per_node.iter().map(|vms| vms.iter().map(|v| v.1).sum()).collect();
        let max = sums.iter().cloned().fold(f64::MIN, f64::max);
        let min = sums.iter().cloned().fold(f64::MAX, f64::min);

        let mut vms: Vec<(VmKey, f64, NodeId)> = per_node
            .iter()
            .enumerate()
            .flat_map(|(node, vms)| vms.iter().map(move |(k, r)| (*k, *r, node as NodeId)))
            .collect();
        vms.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1)).then(a.0.cmp(&b.0)));

        let (hot_key, _, hot_node) = *vms.first()?;
        let hot_misses = state.registry.snapshot(hot_key)?.llc_misses;
        if hot_misses < tunables.local_llc_threshold || max - min < tunables.local_imbalance_threshold {
            return None;
        }

        let targets = serpentine_placement(tunables.nr_nodes, vms.len(), hot_node);
        let mut moved = false;
        let mut placed = vec![vec![]; self.nr_nodes()];
        for ((key, rate, node), target) in vms.into_iter().zip(targets) {
            let mut node = node;
            if node != target {
                let name = state.registry.name(key).unwrap_or("?");
                match state.hypervisor.pin_affinity(self.host, name, target) {
                    Ok(()) => {
                        state.registry.with_vm(key, |vm| vm.cpu_affinity = target);
                        debug!("[{}] {} node {} -> {}", self.host, name, node, target);
                        node = target;
                        moved = true;
                    }
                    Err(e) => warn!("[{}] Failed to pin {}: {:#}", self.host, name, e),
                }
            }
            placed[node as usize].push((key, rate));
        }

        if moved {
            info!("[{}] interleaved VMs across nodes", self.host);
            Some(placed)
        } else {
            None
        }
    }

    fn numa_pass(&self, hottest: &[(NodeId, VmKey, f64)]) {
        let state = &self.state;
        for &(node, key, rate) in hottest {
            if rate <= state.tunables.numa_threshold {
                continue;
            }
            let local_id = state.registry.snapshot(key).and_then(|vm| vm.local_id);
            let (name, local_id) = match (state.registry.name(key), local_id) {
                (Some(name), Some(id)) => (name, id),
                _ => continue,
            };

            let residency = match state.hypervisor.query_numa_residency(self.host, local_id) {
                Ok(residency) => residency,
                Err(e) => {
                    warn!("[{}] NUMA residency of {} unknown: {:#}", self.host, name, e);
                    continue;
                }
            };
            if residency.fully_on(node) {
                continue;
            }
            if !state.registry.claim(key) {
                continue;
            }

            match state.hypervisor.migrate(self.host, self.host, name, true) {
                Ok(()) => {
                    state.metrics.numa_migrations.increment(1);
                    info!(
                        "[{}] NUMA migration of {} (rate {:.1}, pages {:?})",
                        self.host, name, rate, residency.pages
                    );
                    let id = match state.hypervisor.query_local_id(self.host, name) {
                        Ok(id) => Some(id),
                        Err(e) => {
                            warn!("[{}] Failed to look up {}: {:#}", self.host, name, e);
                            None
                        }
                    };
                    state.registry.with_vm(key, |vm| vm.local_id = id);
                }
                Err(e) => warn!("[{}] NUMA migration of {} failed: {:#}", self.host, name, e),
            }
            state.registry.release(key);
        }
    }

    /// Everything a monitor does in one cycle before the rendezvous.
    pub fn step(&mut self) -> Result<()> {
        let state = self.state.clone();
        let tunables = &state.tunables;

        let mut per_node = match self.sample() {
            Ok(per_node) => per_node,
            Err(e) => {
                warn!("[{}] Sampling failed: {:#}", self.host, e);
                state.metrics.invalid_samples.increment(1);
                state.pressure.publish(self.host, &vec![0.0; self.nr_nodes()]);
                return Ok(());
            }
        };

        let mut valid = self.is_valid(&per_node);
        if valid && tunables.local_balance {
            if let Some(placed) = self.interleave(&per_node) {
                per_node = placed;
                valid = self.is_valid(&per_node);
            }
        }

        let sums: Vec<f64> = per_node
            .iter()
            .map(|vms| vms.iter().map(|(_, rate)| rate).sum())
            .collect();
        state.pressure.publish(self.host, &sums);

        if !valid {
            let counts: Vec<usize> = per_node.iter().map(|vms| vms.len()).collect();
            warn!(
                "[{}] Expected {} VMs per node, found {:?}, skipping cycle {}",
                self.host, tunables.vms_per_node, counts, self.generation
            );
            state.metrics.invalid_samples.increment(1);
            return Ok(());
        }
        self.valid_cycles += 1;

        let mut hottest = vec![];
        for (node, vms) in per_node.into_iter().enumerate() {
            let ranked = rank_vms(vms);
            if let Some(hc) = extremes(&ranked, self.generation) {
                let socket = SocketKey::new(self.host, node as NodeId);
                state.hot_cold.record(socket, hc)?;
                trace!(
                    "{} hottest={} coldest={} sum={:.1}",
                    socket,
                    hc.hottest,
                    hc.coldest,
                    sums[node]
                );
                if let Some(top) = ranked.last() {
                    hottest.push((node as NodeId, top.key, *top.miss_rate));
                }
            }
        }

        if self.valid_cycles % tunables.numa_period == 0 {
            self.numa_pass(&hottest);
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let state = self.state.clone();

        while !state.shutdown.load(Ordering::Relaxed) {
            self.generation += 1;
            self.step()?;

            match state.rendezvous.wait(&state.shutdown) {
                None => break,
                Some(true) => {
                    if !state.handoff.announce(self.generation, &state.shutdown)? {
                        break;
                    }
                }
                Some(false) => {}
            }

            if !state.gates.wait(self.index, self.generation, &state.shutdown)? {
                break;
            }
            if !sleep_unless_shutdown(&state.shutdown, state.tunables.local_interval()) {
                break;
            }
        }
        Ok(())
    }
}

/// Entry point of a local monitor crew worker.
pub fn run_worker(worker: Worker<SchedState>) -> Result<()> {
    let mut monitor = LocalMonitor::new(worker.shared.clone(), worker.index);
    let host = monitor.host();
    let hv = &worker.shared.hypervisor;

    if let Err(e) = hv.start_sampling(host) {
        warn!("[{}] Failed to start sampling: {:#}", host, e);
    }
    let res = monitor.run();
    if let Err(e) = hv.stop_sampling(host) {
        warn!("[{}] Failed to stop sampling: {:#}", host, e);
    }
    debug!("[{}] local monitor exiting", host);
    res
}
