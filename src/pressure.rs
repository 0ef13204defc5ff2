// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cache pressure
//!
//! Pressure of a socket is the sum of the LLC miss rates of the VMs pinned
//! to it during one cycle. Local monitors publish it into the
//! [`PressureMap`] and record each socket's hottest and coldest VM in the
//! [`HotColdTable`]; the global rebalancer consumes both once per cycle.
//!
//! Neither structure is cumulative. The pressure map is emptied when the
//! global rebalancer takes it, and hot/cold entries carry the generation of
//! the cycle that wrote them so a stale entry is never mistaken for a fresh
//! one.
use core::cmp::Ordering;

use std::collections::BTreeMap;
use std::mem;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::Result;
use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;

use crate::config::Tunables;
use crate::fleet::HostId;
use crate::fleet::SocketKey;
use crate::fleet::VmKey;

/// Turns raw counters into a miss rate normalized to the sampling window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MissRateModel {
    pub idle_floor: u64,
    pub llc_miss_scale: f64,
    pub retired_inst_scale: f64,
}

impl Default for MissRateModel {
    fn default() -> Self {
        Self::from_tunables(&Tunables::default())
    }
}

impl MissRateModel {
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            idle_floor: tunables.idle_floor,
            llc_miss_scale: tunables.llc_miss_scale,
            retired_inst_scale: tunables.retired_inst_scale,
        }
    }

    pub fn miss_rate(&self, retired_insts: u64, llc_misses: u64) -> f64 {
        if llc_misses < self.idle_floor && retired_insts < self.idle_floor {
            return 0.0;
        }

        let window = (retired_insts as f64 * self.retired_inst_scale) / 1_000_000.0;
        if window <= 0.0 {
            return 0.0;
        }
        (llc_misses as f64 * self.llc_miss_scale) / window
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-socket pressure of the current cycle.
#[derive(Default)]
pub struct PressureMap {
    map: Mutex<BTreeMap<SocketKey, f64>>,
}

impl PressureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the pressure of every node of `host`, `per_node[i]` being
    /// node `i`.
    pub fn publish(&self, host: HostId, per_node: &[f64]) {
        let mut map = lock(&self.map);
        for (node, pressure) in per_node.iter().enumerate() {
            map.insert(SocketKey::new(host, node as u32), *pressure);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// If exactly `expected` sockets have reported, take the map and leave
    /// an empty one behind.
    pub fn take_complete(&self, expected: usize) -> Option<BTreeMap<SocketKey, f64>> {
        let mut map = lock(&self.map);
        if map.len() != expected {
            return None;
        }
        Some(mem::take(&mut *map))
    }
}

/// Hottest and coldest VM of a socket in one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HotCold {
    pub hottest: VmKey,
    pub coldest: VmKey,
    pub generation: u64,
}

/// One slot per socket, each behind its own lock.
pub struct HotColdTable {
    slots: BTreeMap<SocketKey, Mutex<Option<HotCold>>>,
}

impl HotColdTable {
    pub fn new(nr_hosts: u32, nr_nodes: u32) -> Self {
        let mut slots = BTreeMap::new();
        for host in 1..=nr_hosts {
            for node in 0..nr_nodes {
                slots.insert(SocketKey::new(host, node), Mutex::new(None));
            }
        }
        Self { slots }
    }

    fn slot(&self, socket: SocketKey) -> Result<&Mutex<Option<HotCold>>> {
        self.slots
            .get(&socket)
            .ok_or_else(|| anyhow!("Unknown socket {}", socket))
    }

    pub fn record(&self, socket: SocketKey, entry: HotCold) -> Result<()> {
        *lock(self.slot(socket)?) = Some(entry);
        Ok(())
    }

    pub fn clear(&self, socket: SocketKey) -> Result<()> {
        *lock(self.slot(socket)?) = None;
        Ok(())
    }

    /// The entry of `socket` if it was written in cycle `generation`.
    pub fn get(&self, socket: SocketKey, generation: u64) -> Option<HotCold> {
        let slot = self.slots.get(&socket)?;
        let entry = *lock(slot);
        entry.filter(|e| e.generation == generation)
    }
}

macro_rules! impl_ord_for_type {
    ($($t:ty),*) => {
        $(
            impl PartialEq for $t {
                fn eq(&self, other: &Self) -> bool {
                    <dyn LoadOrdered>::eq(self, other)
                }
            }

            impl Eq for $t {}

            impl PartialOrd for $t {
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(<dyn LoadOrdered>::cmp(self, other))
                }
            }

            impl Ord for $t {
                fn cmp(&self, other: &Self) -> Ordering {
                    <dyn LoadOrdered>::cmp(self, other)
                }
            }
        )*
    };
}

/// Ordering by load, ties broken by a stable identity so that sorting is
/// deterministic.
pub trait LoadOrdered {
    fn get_load(&self) -> OrderedFloat<f64>;
    fn tiebreak(&self) -> u64;
}

impl dyn LoadOrdered {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        <dyn LoadOrdered>::cmp(self, other) == Ordering::Equal
    }

    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.get_load()
            .cmp(&other.get_load())
            .then_with(|| self.tiebreak().cmp(&other.tiebreak()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VmLoad {
    pub key: VmKey,
    pub miss_rate: OrderedFloat<f64>,
}

impl LoadOrdered for VmLoad {
    fn get_load(&self) -> OrderedFloat<f64> {
        self.miss_rate
    }

    fn tiebreak(&self) -> u64 {
        self.key as u64
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SocketLoad {
    pub socket: SocketKey,
    pub pressure: OrderedFloat<f64>,
}

impl LoadOrdered for SocketLoad {
    fn get_load(&self) -> OrderedFloat<f64> {
        self.pressure
    }

    fn tiebreak(&self) -> u64 {
        ((self.socket.host as u64) << 32) | self.socket.node as u64
    }
}

impl_ord_for_type!(VmLoad, SocketLoad);

/// The VMs of one socket, coldest first.
pub fn rank_vms(vms: impl IntoIterator<Item = (VmKey, f64)>) -> SortedVec<VmLoad> {
    SortedVec::from_unsorted(
        vms.into_iter()
            .map(|(key, rate)| VmLoad {
                key,
                miss_rate: OrderedFloat(rate),
            })
            .collect(),
    )
}

/// Hottest and coldest of a ranking, None if it is empty.
pub fn extremes(ranked: &SortedVec<VmLoad>, generation: u64) -> Option<HotCold> {
    Some(HotCold {
        hottest: ranked.last()?.key,
        coldest: ranked.first()?.key,
        generation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_rate() {
        let m = MissRateModel::default();
        assert_eq!(m.miss_rate(15, 15), 0.0);
        assert_eq!(m.miss_rate(1_000_000, 100_000), 2000.0);
        assert_eq!(m.miss_rate(0, 500), 0.0);
        // Only one counter below the floor is not idle.
        assert!(m.miss_rate(1_000, 15) > 0.0);
    }

    #[test]
    fn test_pressure_map_only_taken_when_complete() {
        let map = PressureMap::new();
        map.publish(1, &[10.0, 20.0]);
        assert!(map.take_complete(4).is_none());
        assert_eq!(map.len(), 2);

        map.publish(2, &[30.0, 40.0]);
        map.publish(2, &[31.0, 41.0]);
        let taken = map.take_complete(4).unwrap();
        assert_eq!(taken.len(), 4);
        assert_eq!(taken[&SocketKey::new(2, 1)], 41.0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_hot_cold_generation() {
        let t = HotColdTable::new(2, 2);
        let s = SocketKey::new(2, 1);
        let e = HotCold {
            hottest: 3,
            coldest: 4,
            generation: 7,
        };
        t.record(s, e).unwrap();
        assert_eq!(t.get(s, 7), Some(e));
        assert_eq!(t.get(s, 8), None);
        t.clear(s).unwrap();
        assert_eq!(t.get(s, 7), None);
        assert!(t.record(SocketKey::new(3, 0), e).is_err());
    }

    #[test]
    fn test_rank_vms() {
        let ranked = rank_vms(vec![(0, 5.0), (1, 50.0), (2, 0.5), (3, 50.0)]);
        let order: Vec<VmKey> = ranked.iter().map(|v| v.key).collect();
        assert_eq!(order, vec![2, 0, 1, 3]);

        let hc = extremes(&ranked, 1).unwrap();
        assert_eq!((hc.hottest, hc.coldest), (3, 2));
        assert!(extremes(&rank_vms(vec![]), 1).is_none());
    }
}
