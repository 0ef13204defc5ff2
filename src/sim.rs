// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Simulated fleet
//!
//! [`SimHypervisor`] keeps a whole fleet in memory. Tests set counters by
//! hand and inspect the actions the rebalancer took; `--simulate` runs it
//! with synthetic workloads so the three tiers can be exercised without any
//! Xen host.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::debug;

use crate::fleet::HostId;
use crate::fleet::NodeId;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::NumaResidency;
use crate::hypervisor::VmDescriptor;
use crate::hypervisor::VmSample;

/// Pages of a fully resident simulated VM.
pub const SIM_VM_PAGES: u64 = 262144;

/// An action the rebalancer took against the simulated fleet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimAction {
    Pin {
        host: HostId,
        name: String,
        node: NodeId,
    },
    Migrate {
        src: HostId,
        dest: HostId,
        name: String,
        numa_local: bool,
    },
}

#[derive(Clone, Debug)]
struct SimVm {
    host: HostId,
    local_id: u32,
    node: NodeId,
    retired_insts: u64,
    llc_misses: u64,
    /// Pages per node.
    pages: Vec<u64>,
    /// Synthetic misses per million instructions for `--simulate`.
    intensity: Option<u64>,
}

struct SimState {
    nr_nodes: u32,
    vms: BTreeMap<String, SimVm>,
    next_local_id: BTreeMap<HostId, u32>,
    actions: Vec<SimAction>,
    failing: BTreeSet<String>,
    sample_failures: BTreeSet<HostId>,
    lookup_failures: BTreeMap<String, u32>,
    rng: u64,
}

impl SimState {
    fn alloc_local_id(&mut self, host: HostId) -> u32 {
        let next = self.next_local_id.entry(host).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn vm_mut(&mut self, host: HostId, name: &str) -> Result<&mut SimVm> {
        match self.vms.get_mut(name) {
            Some(vm) if vm.host == host => Ok(vm),
            Some(vm) => bail!("{} is on host {}, not {}", name, vm.host, host),
            None => bail!("No VM named {}", name),
        }
    }

    // xorshift64*
    fn next_rand(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

pub struct SimHypervisor {
    state: Mutex<SimState>,
}

impl SimHypervisor {
    pub fn new(nr_nodes: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                nr_nodes,
                vms: BTreeMap::new(),
                next_local_id: BTreeMap::new(),
                actions: vec![],
                failing: BTreeSet::new(),
                sample_failures: BTreeSet::new(),
                lookup_failures: BTreeMap::new(),
                rng: 0x9e37_79b9_7f4a_7c15,
            }),
        }
    }

    /// `vms_per_node` idle VMs on every node of hosts `1..=nr_hosts`, named
    /// `vm-{host}-{node}-{i}`.
    pub fn uniform(nr_hosts: u32, nr_nodes: u32, vms_per_node: usize) -> Self {
        let sim = Self::new(nr_nodes);
        for host in 1..=nr_hosts {
            for node in 0..nr_nodes {
                for i in 0..vms_per_node {
                    sim.add_vm(&format!("vm-{}-{}-{}", host, node, i), host, node);
                }
            }
        }
        sim
    }

    /// Like [`SimHypervisor::uniform`] but every VM gets a synthetic
    /// workload so the fleet starts out unbalanced.
    pub fn with_workloads(nr_hosts: u32, nr_nodes: u32, vms_per_node: usize) -> Self {
        let sim = Self::uniform(nr_hosts, nr_nodes, vms_per_node);
        {
            let mut state = sim.lock();
            let names: Vec<String> = state.vms.keys().cloned().collect();
            for name in names {
                let intensity = 1_000 + state.next_rand() % 200_000;
                if let Some(vm) = state.vms.get_mut(&name) {
                    vm.intensity = Some(intensity);
                }
            }
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vm(&self, name: &str, host: HostId, node: NodeId) {
        let mut state = self.lock();
        let local_id = state.alloc_local_id(host);
        let mut pages = vec![0; state.nr_nodes as usize];
        if let Some(p) = pages.get_mut(node as usize) {
            *p = SIM_VM_PAGES;
        }
        state.vms.insert(
            name.to_string(),
            SimVm {
                host,
                local_id,
                node,
                retired_insts: 0,
                llc_misses: 0,
                pages,
                intensity: None,
            },
        );
    }

    pub fn set_counters(&self, name: &str, retired_insts: u64, llc_misses: u64) {
        if let Some(vm) = self.lock().vms.get_mut(name) {
            vm.retired_insts = retired_insts;
            vm.llc_misses = llc_misses;
        }
    }

    pub fn set_pages(&self, name: &str, pages: Vec<u64>) {
        if let Some(vm) = self.lock().vms.get_mut(name) {
            vm.pages = pages;
        }
    }

    /// Make every action against `name` fail.
    pub fn fail_actions_for(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Make sampling of `host` fail.
    pub fn fail_sampling(&self, host: HostId, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.sample_failures.insert(host);
        } else {
            state.sample_failures.remove(&host);
        }
    }

    /// Make the next `times` local id lookups of `name` fail.
    pub fn fail_lookups(&self, name: &str, times: u32) {
        self.lock().lookup_failures.insert(name.to_string(), times);
    }

    /// Move a VM behind the rebalancer's back.
    pub fn repin_externally(&self, name: &str, node: NodeId) {
        if let Some(vm) = self.lock().vms.get_mut(name) {
            vm.node = node;
        }
    }

    pub fn actions(&self) -> Vec<SimAction> {
        self.lock().actions.clone()
    }

    pub fn migrations(&self) -> Vec<SimAction> {
        self.actions()
            .into_iter()
            .filter(|a| matches!(a, SimAction::Migrate { .. }))
            .collect()
    }

    /// (host, node, local id) of `name`.
    pub fn placement(&self, name: &str) -> Option<(HostId, NodeId, u32)> {
        self.lock()
            .vms
            .get(name)
            .map(|vm| (vm.host, vm.node, vm.local_id))
    }
}

impl Hypervisor for SimHypervisor {
    fn discover(&self, host: HostId) -> Result<Vec<VmDescriptor>> {
        let state = self.lock();
        let mut vms: Vec<VmDescriptor> = state
            .vms
            .iter()
            .filter(|(_, vm)| vm.host == host)
            .map(|(name, vm)| VmDescriptor {
                name: name.clone(),
                local_id: vm.local_id,
                cpu_affinity: vm.node,
            })
            .collect();
        vms.sort_by_key(|vm| vm.local_id);
        Ok(vms)
    }

    fn list_resident_vms(&self, host: HostId) -> Result<Vec<VmSample>> {
        let mut state = self.lock();
        if state.sample_failures.contains(&host) {
            bail!("sampling host {} failed", host);
        }

        // Domain-0 is always listed first.
        let mut samples = vec![VmSample {
            local_id: 0,
            retired_insts: 1_000_000,
            llc_misses: 1_000,
        }];
        let names: Vec<String> = state
            .vms
            .iter()
            .filter(|(_, vm)| vm.host == host)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let jitter = state.next_rand() % 1_000;
            let vm = match state.vms.get_mut(&name) {
                Some(vm) => vm,
                None => continue,
            };
            if let Some(intensity) = vm.intensity {
                vm.retired_insts = 1_000_000;
                vm.llc_misses = intensity + jitter;
            }
            samples.push(VmSample {
                local_id: vm.local_id,
                retired_insts: vm.retired_insts,
                llc_misses: vm.llc_misses,
            });
        }
        Ok(samples)
    }

    fn query_affinity(&self, host: HostId, name: &str) -> Result<NodeId> {
        let mut state = self.lock();
        Ok(state.vm_mut(host, name)?.node)
    }

    fn query_local_id(&self, host: HostId, name: &str) -> Result<u32> {
        let mut state = self.lock();
        if let Some(left) = state.lookup_failures.get_mut(name) {
            if *left > 0 {
                *left -= 1;
                bail!("domid lookup of {} on host {} failed", name, host);
            }
        }
        Ok(state.vm_mut(host, name)?.local_id)
    }

    fn pin_affinity(&self, host: HostId, name: &str, node: NodeId) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(name) {
            bail!("vcpu-pin of {} failed", name);
        }
        if node >= state.nr_nodes {
            bail!("No node {} on host {}", node, host);
        }
        state.vm_mut(host, name)?.node = node;
        state.actions.push(SimAction::Pin {
            host,
            name: name.to_string(),
            node,
        });
        Ok(())
    }

    fn migrate(&self, src: HostId, dest: HostId, name: &str, numa_local: bool) -> Result<()> {
        let mut state = self.lock();
        if state.failing.contains(name) {
            bail!("migration of {} failed", name);
        }
        let local_id = state.alloc_local_id(dest);
        let nr_nodes = state.nr_nodes as usize;
        let vm = state.vm_mut(src, name)?;
        vm.host = dest;
        vm.local_id = local_id;
        vm.pages = vec![0; nr_nodes];
        if let Some(p) = vm.pages.get_mut(vm.node as usize) {
            *p = SIM_VM_PAGES;
        }
        debug!("sim: {} moved {} -> {} as {}", name, src, dest, local_id);
        state.actions.push(SimAction::Migrate {
            src,
            dest,
            name: name.to_string(),
            numa_local,
        });
        Ok(())
    }

    fn query_numa_residency(&self, host: HostId, local_id: u32) -> Result<NumaResidency> {
        let state = self.lock();
        state
            .vms
            .values()
            .find(|vm| vm.host == host && vm.local_id == local_id)
            .map(|vm| NumaResidency {
                pages: vm.pages.clone(),
            })
            .ok_or_else(|| anyhow!("No domain {} on host {}", local_id, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_discovery() {
        let sim = SimHypervisor::uniform(2, 2, 2);
        let vms = sim.discover(2).unwrap();
        assert_eq!(vms.len(), 4);
        assert_eq!(vms.iter().filter(|v| v.cpu_affinity == 1).count(), 2);
        assert_eq!(vms[0].local_id, 1);
    }

    #[test]
    fn test_migrate_assigns_new_local_id() {
        let sim = SimHypervisor::uniform(2, 1, 1);
        let (_, _, before) = sim.placement("vm-1-0-0").unwrap();
        sim.migrate(1, 2, "vm-1-0-0", false).unwrap();
        let (host, _, after) = sim.placement("vm-1-0-0").unwrap();
        assert_eq!(host, 2);
        assert_ne!(before, after);
        assert_eq!(sim.query_local_id(2, "vm-1-0-0").unwrap(), after);
        assert!(sim.query_local_id(1, "vm-1-0-0").is_err());

        sim.fail_lookups("vm-1-0-0", 1);
        assert!(sim.query_local_id(2, "vm-1-0-0").is_err());
        assert_eq!(sim.query_local_id(2, "vm-1-0-0").unwrap(), after);
        assert_eq!(sim.migrations().len(), 1);
    }

    #[test]
    fn test_samples_include_domain0() {
        let sim = SimHypervisor::uniform(1, 1, 2);
        sim.set_counters("vm-1-0-1", 1_000_000, 100_000);
        let samples = sim.list_resident_vms(1).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].local_id, 0);
        assert_eq!(samples[2].llc_misses, 100_000);

        sim.fail_sampling(1, true);
        assert!(sim.list_resident_vms(1).is_err());
    }

    #[test]
    fn test_failure_injection() {
        let sim = SimHypervisor::uniform(1, 2, 1);
        sim.fail_actions_for("vm-1-0-0");
        assert!(sim.pin_affinity(1, "vm-1-0-0", 1).is_err());
        assert!(sim.migrate(1, 1, "vm-1-0-0", true).is_err());
        assert!(sim.actions().is_empty());
    }

    #[test]
    fn test_residency() {
        let sim = SimHypervisor::uniform(1, 2, 1);
        let (_, _, id) = sim.placement("vm-1-1-0").unwrap();
        assert!(sim.query_numa_residency(1, id).unwrap().fully_on(1));
        sim.set_pages("vm-1-1-0", vec![100, 200]);
        assert!(!sim.query_numa_residency(1, id).unwrap().fully_on(1));
    }
}
