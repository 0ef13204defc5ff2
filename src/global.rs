// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Global rebalancer
//!
//! A single worker that runs once per cycle, after every local monitor has
//! published its pressure:
//!
//! 1. Take the complete pressure map of the cycle.
//!
//! 2. Pick up to `degree_of_migration` (high, low) socket pairs. Each pick
//!    takes the most and the least pressured socket among the ones not
//!    picked before, so no socket takes part in more than one pair.
//!
//! 3. Drop pairs whose pressure gap is below `global_llc_threshold`, pairs
//!    whose hottest/coldest VM is unknown for this cycle, pairs involving a
//!    VM that is already being moved, and pairs of VMs that were swapped
//!    with each other recently ([`SwapHistory`]).
//!
//! 4. For each remaining pair, enqueue two migration requests, the hottest
//!    VM of the high socket and the coldest VM of the low socket trading
//!    places, then wait for the migration crew to finish all of them.
//!
//! 5. Release the cycle gates so the local monitors start the next cycle.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;

use crate::crew::sleep_unless_shutdown;
use crate::crew::Worker;
use crate::fleet::SocketKey;
use crate::fleet::VirtualMachine;
use crate::fleet::VmKey;
use crate::migration::MigrationRequest;
use crate::pressure::SocketLoad;
use crate::scheduler::SchedState;
use crate::stats::CycleStats;
use crate::stats::SwapStat;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SocketPair {
    pub high: SocketKey,
    pub low: SocketKey,
    pub high_pressure: f64,
    pub low_pressure: f64,
}

impl SocketPair {
    pub fn gap(&self) -> f64 {
        self.high_pressure - self.low_pressure
    }
}

/// Select up to `k` disjoint socket pairs, most imbalanced first.
///
/// Sockets are ordered by (pressure, socket) ascending, so ties go to the
/// larger socket for the high pick and to the smaller one for the low pick.
/// A lone remaining socket yields a pair with itself, which eligibility
/// rejects.
pub fn select_pairs(pressure: &BTreeMap<SocketKey, f64>, k: usize) -> Vec<SocketPair> {
    let mut picked: BTreeSet<SocketKey> = BTreeSet::new();
    let mut pairs = vec![];

    for _ in 0..k {
        let candidates = SortedVec::from_unsorted(
            pressure
                .iter()
                .filter(|(socket, _)| !picked.contains(*socket))
                .map(|(socket, pressure)| SocketLoad {
                    socket: *socket,
                    pressure: OrderedFloat(*pressure),
                })
                .collect(),
        );
        let (high, low) = match (candidates.last(), candidates.first()) {
            (Some(high), Some(low)) => (*high, *low),
            _ => break,
        };

        picked.insert(high.socket);
        picked.insert(low.socket);
        pairs.push(SocketPair {
            high: high.socket,
            low: low.socket,
            high_pressure: *high.pressure,
            low_pressure: *low.pressure,
        });
    }
    pairs
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rejection {
    SameSocket,
    BelowThreshold,
    MissingVm,
    VmBusy,
    Hysteresis,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::SameSocket => write!(f, "same_socket"),
            Rejection::BelowThreshold => write!(f, "below_threshold"),
            Rejection::MissingVm => write!(f, "missing_vm"),
            Rejection::VmBusy => write!(f, "vm_busy"),
            Rejection::Hysteresis => write!(f, "hysteresis"),
        }
    }
}

pub fn check_eligibility(pair: &SocketPair, threshold: f64) -> Result<(), Rejection> {
    if pair.high == pair.low {
        return Err(Rejection::SameSocket);
    }
    if pair.gap() < threshold {
        return Err(Rejection::BelowThreshold);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct HeldPair {
    rejections: u32,
    touched: u64,
}

/// Remembers which VM pairs were swapped and holds them back for up to
/// `patience` proposals afterwards. The pair is unordered, so swapping the
/// two VMs straight back counts as the same swap.
pub struct SwapHistory {
    patience: u32,
    held: BTreeMap<(VmKey, VmKey), HeldPair>,
}

fn pair_key(a: VmKey, b: VmKey) -> (VmKey, VmKey) {
    (a.min(b), a.max(b))
}

impl SwapHistory {
    pub fn new(patience: u32) -> Self {
        Self {
            patience,
            held: BTreeMap::new(),
        }
    }

    /// Whether `a` and `b` may be swapped in cycle `generation`.
    pub fn admit(&mut self, a: VmKey, b: VmKey, generation: u64) -> bool {
        let patience = self.patience;
        match self.held.get_mut(&pair_key(a, b)) {
            Some(held) if held.rejections < patience => {
                held.rejections += 1;
                held.touched = generation;
                false
            }
            _ => true,
        }
    }

    pub fn record(&mut self, a: VmKey, b: VmKey, generation: u64) {
        self.held.insert(
            pair_key(a, b),
            HeldPair {
                rejections: 0,
                touched: generation,
            },
        );
    }

    /// Forget pairs that have not come up for more than `patience` cycles.
    pub fn prune(&mut self, generation: u64) {
        let patience = self.patience as u64;
        self.held
            .retain(|_, held| generation.saturating_sub(held.touched) <= patience);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// A pair that passed every filter, with both VMs claimed.
#[derive(Clone, Debug)]
pub struct Swap {
    pub pair: SocketPair,
    pub high_vm: VirtualMachine,
    pub low_vm: VirtualMachine,
}

impl Swap {
    /// One request per direction. Each VM takes over the node of the other.
    pub fn requests(&self, generation: u64) -> [MigrationRequest; 2] {
        [
            MigrationRequest {
                vm_key: self.high_vm.key,
                src_host: self.high_vm.host,
                dest_host: self.low_vm.host,
                local_id: self.high_vm.local_id,
                adversary_affinity: self.low_vm.cpu_affinity,
                generation,
            },
            MigrationRequest {
                vm_key: self.low_vm.key,
                src_host: self.low_vm.host,
                dest_host: self.high_vm.host,
                local_id: self.low_vm.local_id,
                adversary_affinity: self.high_vm.cpu_affinity,
                generation,
            },
        ]
    }

    pub fn stat(&self) -> SwapStat {
        SwapStat {
            high: self.pair.high,
            low: self.pair.low,
            high_vm: self.high_vm.key,
            low_vm: self.low_vm.key,
            gap: self.pair.gap(),
        }
    }
}

/// Run a selected pair through every filter and claim its VMs.
pub fn resolve(
    state: &SchedState,
    history: &mut SwapHistory,
    pair: SocketPair,
    generation: u64,
) -> Result<Swap, Rejection> {
    check_eligibility(&pair, state.tunables.global_llc_threshold)?;

    let high = state.hot_cold.get(pair.high, generation);
    let low = state.hot_cold.get(pair.low, generation);
    let (high_key, low_key) = match (high, low) {
        (Some(high), Some(low)) => (high.hottest, low.coldest),
        _ => return Err(Rejection::MissingVm),
    };
    let (high_vm, low_vm) = match (
        state.registry.snapshot(high_key),
        state.registry.snapshot(low_key),
    ) {
        (Some(h), Some(l)) if h.socket() == pair.high && l.socket() == pair.low => (h, l),
        _ => return Err(Rejection::MissingVm),
    };

    if !history.admit(high_key, low_key, generation) {
        return Err(Rejection::Hysteresis);
    }

    if !state.registry.claim(high_key) {
        return Err(Rejection::VmBusy);
    }
    if !state.registry.claim(low_key) {
        state.registry.release(high_key);
        return Err(Rejection::VmBusy);
    }

    Ok(Swap {
        pair,
        high_vm,
        low_vm,
    })
}

fn count_rejection(state: &SchedState, reason: Rejection) {
    let m = &state.metrics;
    match reason {
        Rejection::SameSocket => m.rejected_same_socket.increment(1),
        Rejection::BelowThreshold => m.rejected_below_threshold.increment(1),
        Rejection::MissingVm => m.rejected_missing_vm.increment(1),
        Rejection::VmBusy => m.rejected_vm_busy.increment(1),
        Rejection::Hysteresis => m.rejected_hysteresis.increment(1),
    }
}

fn log_cycle(stats: &CycleStats) -> Result<()> {
    let mut buf = vec![];
    stats.format(&mut buf)?;
    for line in String::from_utf8_lossy(&buf).lines() {
        if stats.swaps.is_empty() {
            debug!("{}", line);
        } else {
            info!("{}", line);
        }
    }
    Ok(())
}

/// Entry point of the global rebalancer crew.
pub fn run_worker(worker: Worker<SchedState>) -> Result<()> {
    let state: Arc<SchedState> = worker.shared;
    let tunables = &state.tunables;
    let expected = tunables.nr_sockets(state.registry.nr_hosts());
    let mut history = SwapHistory::new(tunables.swap_patience);

    while !state.shutdown.load(Ordering::Relaxed) {
        let generation = match state.handoff.await_report(&state.shutdown) {
            Some(generation) => generation,
            None => break,
        };
        let started = Instant::now();
        state.metrics.cycles.increment(1);

        let pressure = match state.pressure.take_complete(expected) {
            Some(pressure) => pressure,
            None => {
                warn!(
                    "Cycle {}: pressure map has {} of {} sockets, skipping",
                    generation,
                    state.pressure.len(),
                    expected
                );
                state.gates.release_all(generation);
                continue;
            }
        };
        for (socket, p) in pressure.iter() {
            state.metrics.socket_pressure(*socket, *p);
        }

        let mut stats = CycleStats {
            generation,
            pressure: pressure.clone(),
            ..Default::default()
        };
        let mut swaps = vec![];
        for pair in select_pairs(&pressure, tunables.degree_of_migration) {
            match resolve(&state, &mut history, pair, generation) {
                Ok(swap) => swaps.push(swap),
                Err(reason) => {
                    debug!(
                        "Cycle {}: {} vs {} rejected ({})",
                        generation, pair.high, pair.low, reason
                    );
                    count_rejection(&state, reason);
                    *stats.rejected.entry(reason.to_string()).or_insert(0) += 1;
                }
            }
        }

        if state.shutdown.load(Ordering::Relaxed) {
            for swap in swaps.iter() {
                state.registry.release(swap.high_vm.key);
                state.registry.release(swap.low_vm.key);
            }
            break;
        }

        let requests: Vec<MigrationRequest> = swaps
            .iter()
            .flat_map(|swap| swap.requests(generation))
            .collect();
        state.completion.begin(generation, requests.len())?;
        for req in requests {
            state.migrations.enqueue(req)?;
        }
        for swap in swaps.iter() {
            history.record(swap.high_vm.key, swap.low_vm.key, generation);
            state.metrics.swaps_dispatched.increment(1);
            stats.swaps.push(swap.stat());
        }

        let summary = match state.completion.wait(&state.shutdown) {
            Some(summary) => summary,
            None => break,
        };
        stats.migrations_issued = summary.issued;
        stats.migrations_failed = summary.failed;
        stats.duration_us = started.elapsed().as_micros() as u64;
        state.metrics.cycle_duration.record(stats.duration_us as f64);

        log_cycle(&stats)?;
        state.stats.push(stats);
        history.prune(generation);

        state.gates.release_all(generation);
        if !sleep_unless_shutdown(&state.shutdown, tunables.global_interval()) {
            break;
        }
    }

    debug!("global rebalancer exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[((u32, u32), f64)]) -> BTreeMap<SocketKey, f64> {
        entries
            .iter()
            .map(|((h, n), p)| (SocketKey::new(*h, *n), *p))
            .collect()
    }

    #[test]
    fn test_select_two_hosts_one_pick() {
        let pressure = map(&[((1, 0), 3000.0), ((1, 1), 100.0), ((2, 0), 200.0), ((2, 1), 2900.0)]);
        let pairs = select_pairs(&pressure, 1);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].high, SocketKey::new(1, 0));
        assert_eq!(pairs[0].low, SocketKey::new(1, 1));
        assert_eq!(pairs[0].gap(), 2900.0);
        assert_eq!(check_eligibility(&pairs[0], 1000.0), Ok(()));
    }

    #[test]
    fn test_select_is_disjoint() {
        let pressure = map(&[
            ((1, 0), 3000.0),
            ((1, 1), 100.0),
            ((2, 0), 200.0),
            ((2, 1), 2900.0),
            ((3, 0), 2900.0),
            ((3, 1), 50.0),
        ]);
        let pairs = select_pairs(&pressure, 4);
        let mut seen = BTreeSet::new();
        for pair in pairs.iter() {
            assert!(seen.insert(pair.high));
            assert!(seen.insert(pair.low));
        }
        assert_eq!(pairs.len(), 3);
        assert_eq!((pairs[0].high, pairs[0].low), (SocketKey::new(1, 0), SocketKey::new(3, 1)));
        // Equal pressure: the larger socket is the high pick.
        assert_eq!((pairs[1].high, pairs[1].low), (SocketKey::new(3, 0), SocketKey::new(1, 1)));
        assert_eq!((pairs[2].high, pairs[2].low), (SocketKey::new(2, 1), SocketKey::new(2, 0)));
    }

    #[test]
    fn test_select_odd_socket_count() {
        let pressure = map(&[((1, 0), 10.0), ((1, 1), 20.0), ((2, 0), 30.0)]);
        let pairs = select_pairs(&pressure, 3);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].high, pairs[1].low);
        assert_eq!(check_eligibility(&pairs[1], 0.0), Err(Rejection::SameSocket));
        assert!(select_pairs(&BTreeMap::new(), 2).is_empty());
    }

    #[test]
    fn test_eligibility_threshold() {
        let pair = SocketPair {
            high: SocketKey::new(1, 0),
            low: SocketKey::new(2, 0),
            high_pressure: 1999.0,
            low_pressure: 1000.0,
        };
        assert_eq!(check_eligibility(&pair, 1000.0), Err(Rejection::BelowThreshold));
        assert_eq!(check_eligibility(&pair, 999.0), Ok(()));
    }

    #[test]
    fn test_history_holds_pair_for_patience() {
        let mut h = SwapHistory::new(5);
        assert!(h.admit(1, 2, 1));
        h.record(1, 2, 1);

        // Proposed every following cycle: held for five, then let through.
        for generation in 2..=6 {
            assert!(!h.admit(1, 2, generation), "cycle {}", generation);
        }
        assert!(h.admit(1, 2, 7));
        assert!(h.admit(1, 3, 2));
    }

    #[test]
    fn test_history_pair_is_unordered() {
        let mut h = SwapHistory::new(5);
        h.record(4, 9, 1);
        assert!(!h.admit(9, 4, 2));
        assert!(!h.admit(4, 9, 3));
    }

    #[test]
    fn test_history_prunes_stale_pairs() {
        let mut h = SwapHistory::new(2);
        h.record(1, 2, 1);
        h.prune(3);
        assert_eq!(h.len(), 1);
        h.prune(4);
        assert!(h.is_empty());
        assert!(h.admit(1, 2, 4));
    }
}
