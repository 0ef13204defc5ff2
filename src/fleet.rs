// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Fleet registry
//!
//! The registry owns every [`VirtualMachine`] record. Records are created
//! once at discovery and never removed; what changes over time is where a
//! VM lives (`host`, `local_id`, `cpu_affinity`) and its latest counters.
//! A `local_id` of `None` means the hypervisor's id for the VM on its
//! current host is not known yet; the host's monitor looks it up again.
//!
//! Each record sits behind its own mutex. Placement fields are only written
//! by whoever moved the VM to `VmState::Migrating` first ([`FleetRegistry::claim`]),
//! which gives every VM a single writer without a registry-wide lock. The
//! host index is the only other lock; when both are needed it is taken
//! first.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;

use crate::hypervisor::Hypervisor;

pub type VmKey = u32;
pub type HostId = u32;
pub type NodeId = u32;

/// A NUMA node of one host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketKey {
    pub host: HostId,
    pub node: NodeId,
}

impl SocketKey {
    pub fn new(host: HostId, node: NodeId) -> Self {
        Self { host, node }
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HOST[{:02}] NODE[{:02}]", self.host, self.node)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    Running,
    Migrating,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => write!(f, "RUNNING"),
            VmState::Migrating => write!(f, "MIGRATING"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VirtualMachine {
    pub key: VmKey,
    pub host: HostId,
    pub local_id: Option<u32>,
    pub cpu_affinity: NodeId,
    pub retired_insts: u64,
    pub llc_misses: u64,
    pub miss_rate: f64,
    pub state: VmState,
}

impl VirtualMachine {
    pub fn socket(&self) -> SocketKey {
        SocketKey::new(self.host, self.cpu_affinity)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FleetRegistry {
    nr_hosts: u32,
    nr_nodes: u32,
    vms: BTreeMap<VmKey, Mutex<VirtualMachine>>,
    names: BTreeMap<VmKey, String>,
    by_host: Mutex<BTreeMap<HostId, Vec<VmKey>>>,
}

impl FleetRegistry {
    /// An empty registry for hosts `1..=nr_hosts`.
    pub fn new(nr_hosts: u32, nr_nodes: u32) -> Self {
        Self {
            nr_hosts,
            nr_nodes,
            vms: BTreeMap::new(),
            names: BTreeMap::new(),
            by_host: Mutex::new((1..=nr_hosts).map(|h| (h, vec![])).collect()),
        }
    }

    /// Ask `hv` for the VMs of every host. Keys are handed out in discovery
    /// order, host by host.
    pub fn discover(hv: &dyn Hypervisor, nr_hosts: u32, nr_nodes: u32) -> Result<Self> {
        let mut registry = Self::new(nr_hosts, nr_nodes);
        for host in 1..=nr_hosts {
            let vms = hv
                .discover(host)
                .with_context(|| format!("Failed to discover VMs on host {}", host))?;
            for vm in vms {
                let key = registry.register(&vm.name, host, vm.local_id, vm.cpu_affinity)?;
                debug!(
                    "VM[{:03}] {} host={} local_id={} node={}",
                    key, vm.name, host, vm.local_id, vm.cpu_affinity
                );
            }
        }
        if registry.is_empty() {
            bail!("No VMs found on {} hosts", nr_hosts);
        }
        info!("Discovered {} VMs on {} hosts", registry.len(), nr_hosts);
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        host: HostId,
        local_id: u32,
        cpu_affinity: NodeId,
    ) -> Result<VmKey> {
        if host == 0 || host > self.nr_hosts {
            bail!("{} is on host {} outside 1..={}", name, host, self.nr_hosts);
        }
        if cpu_affinity >= self.nr_nodes {
            bail!("{} is pinned to node {} of {}", name, cpu_affinity, self.nr_nodes);
        }
        if self.names.values().any(|n| n == name) {
            bail!("Duplicate VM name {}", name);
        }

        let key = self.vms.len() as VmKey;
        self.vms.insert(
            key,
            Mutex::new(VirtualMachine {
                key,
                host,
                local_id: Some(local_id),
                cpu_affinity,
                retired_insts: 0,
                llc_misses: 0,
                miss_rate: 0.0,
                state: VmState::Running,
            }),
        );
        self.names.insert(key, name.to_string());
        self.by_host
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host)
            .or_default()
            .push(key);
        Ok(key)
    }

    pub fn nr_hosts(&self) -> u32 {
        self.nr_hosts
    }

    pub fn nr_nodes(&self) -> u32 {
        self.nr_nodes
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = VmKey> + '_ {
        self.vms.keys().copied()
    }

    pub fn name(&self, key: VmKey) -> Option<&str> {
        self.names.get(&key).map(|n| n.as_str())
    }

    /// Copy of the current record.
    pub fn snapshot(&self, key: VmKey) -> Option<VirtualMachine> {
        self.vms.get(&key).map(|vm| lock(vm).clone())
    }

    /// Run `f` on the record with its lock held.
    pub fn with_vm<R>(&self, key: VmKey, f: impl FnOnce(&mut VirtualMachine) -> R) -> Option<R> {
        self.vms.get(&key).map(|vm| f(&mut lock(vm)))
    }

    /// Keys of the VMs currently placed on `host`.
    pub fn host_vms(&self, host: HostId) -> Vec<VmKey> {
        lock(&self.by_host).get(&host).cloned().unwrap_or_default()
    }

    /// The VM known to run on `host` as `local_id`.
    pub fn find_local(&self, host: HostId, local_id: u32) -> Option<VmKey> {
        self.host_vms(host).into_iter().find(|key| {
            self.with_vm(*key, |vm| vm.host == host && vm.local_id == Some(local_id))
                .unwrap_or(false)
        })
    }

    /// Running VMs of `host` whose local id is unknown or not among `seen`.
    pub fn unresolved(&self, host: HostId, seen: &BTreeSet<u32>) -> Vec<VmKey> {
        self.host_vms(host)
            .into_iter()
            .filter(|key| {
                self.with_vm(*key, |vm| {
                    vm.state == VmState::Running
                        && vm.host == host
                        && !vm.local_id.is_some_and(|id| seen.contains(&id))
                })
                .unwrap_or(false)
            })
            .collect()
    }

    /// Mark `key` as migrating. Returns false if it already was.
    pub fn claim(&self, key: VmKey) -> bool {
        self.with_vm(key, |vm| {
            if vm.state == VmState::Migrating {
                false
            } else {
                vm.state = VmState::Migrating;
                true
            }
        })
        .unwrap_or(false)
    }

    pub fn release(&self, key: VmKey) {
        self.with_vm(key, |vm| vm.state = VmState::Running);
    }

    /// Move `key` to `dest` in the host index and in its record.
    pub fn relocate(&self, key: VmKey, dest: HostId) -> Result<()> {
        if dest == 0 || dest > self.nr_hosts {
            bail!("Cannot move VM {} to unknown host {}", key, dest);
        }
        let vm = self
            .vms
            .get(&key)
            .ok_or_else(|| anyhow!("Unknown VM {}", key))?;

        let mut by_host = lock(&self.by_host);
        let mut vm = lock(vm);
        if vm.host == dest {
            return Ok(());
        }
        if let Some(list) = by_host.get_mut(&vm.host) {
            list.retain(|k| *k != key);
        }
        by_host.entry(dest).or_default().push(key);
        vm.host = dest;
        Ok(())
    }

    /// Every VM has a name and appears in exactly one host list, the one its
    /// record points at.
    pub fn check_invariants(&self) -> Result<()> {
        let by_host = lock(&self.by_host);
        for (key, vm) in self.vms.iter() {
            if !self.names.contains_key(key) {
                bail!("VM {} has no name", key);
            }
            let hosts: Vec<HostId> = by_host
                .iter()
                .filter(|(_, keys)| keys.contains(key))
                .map(|(h, _)| *h)
                .collect();
            let host = lock(vm).host;
            if hosts != [host] {
                bail!("VM {} is on host {} but indexed under {:?}", key, host, hosts);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FleetRegistry {
        let mut r = FleetRegistry::new(2, 2);
        r.register("a", 1, 10, 0).unwrap();
        r.register("b", 1, 11, 1).unwrap();
        r.register("c", 2, 20, 0).unwrap();
        r
    }

    #[test]
    fn test_register() {
        let mut r = registry();
        assert_eq!(r.len(), 3);
        assert_eq!(r.name(2), Some("c"));
        assert_eq!(r.host_vms(1), vec![0, 1]);
        assert_eq!(r.find_local(1, 11), Some(1));
        assert_eq!(r.find_local(2, 11), None);
        assert!(r.register("a", 2, 21, 0).is_err());
        assert!(r.register("d", 3, 21, 0).is_err());
        assert!(r.register("d", 2, 21, 2).is_err());
        r.check_invariants().unwrap();
    }

    #[test]
    fn test_relocate_moves_index_and_record() {
        let r = registry();
        r.relocate(0, 2).unwrap();
        assert_eq!(r.host_vms(1), vec![1]);
        assert_eq!(r.host_vms(2), vec![2, 0]);
        assert_eq!(r.snapshot(0).unwrap().host, 2);
        r.check_invariants().unwrap();

        r.relocate(0, 2).unwrap();
        assert_eq!(r.host_vms(2), vec![2, 0]);
        assert!(r.relocate(0, 5).is_err());
        assert!(r.relocate(9, 1).is_err());
    }

    #[test]
    fn test_unresolved_local_ids() {
        let r = registry();
        let seen = BTreeSet::from([10, 11]);
        assert!(r.unresolved(1, &seen).is_empty());

        r.with_vm(0, |vm| vm.local_id = None);
        assert_eq!(r.unresolved(1, &seen), vec![0]);
        assert_eq!(r.find_local(1, 10), None);
        assert_eq!(r.unresolved(1, &BTreeSet::from([10])), vec![0, 1]);

        assert!(r.claim(1));
        assert_eq!(r.unresolved(1, &BTreeSet::new()), vec![0]);
        assert_eq!(r.unresolved(2, &BTreeSet::from([20])), Vec::<VmKey>::new());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let r = registry();
        assert!(r.claim(1));
        assert!(!r.claim(1));
        assert_eq!(r.snapshot(1).unwrap().state, VmState::Migrating);
        r.release(1);
        assert!(r.claim(1));
        assert!(!r.claim(42));
    }

    #[test]
    fn test_socket_display() {
        assert_eq!(SocketKey::new(3, 1).to_string(), "HOST[03] NODE[01]");
    }
}
