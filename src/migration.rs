// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Migration crew
//!
//! A pool of `2 * degree_of_migration` workers sharing one [`WorkQueue`] of
//! [`MigrationRequest`]s. Each request moves one VM of a swap pair: pin it
//! to the node of its partner if needed, migrate it to the partner's host,
//! then record the new placement in the fleet registry.
//!
//! A failed request is logged and still reported to the cycle's
//! [`crate::cycle::CompletionGroup`]; the VM record keeps its last known
//! placement and the next cycle works from there. A VM that moved but whose
//! new local id could not be looked up is left with an unknown id, which
//! the monitor of its new host resolves.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use crate::crew::Worker;
use crate::fleet::HostId;
use crate::fleet::NodeId;
use crate::fleet::VmKey;
use crate::scheduler::SchedState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationRequest {
    pub vm_key: VmKey,
    pub src_host: HostId,
    pub dest_host: HostId,
    /// Local id of the VM on `src_host` when the request was made.
    pub local_id: Option<u32>,
    /// Node the VM must be pinned to, the one its swap partner occupied.
    pub adversary_affinity: NodeId,
    pub generation: u64,
}

/// Carry out one request against the hypervisor and the registry.
pub fn execute(state: &SchedState, req: &MigrationRequest) -> Result<()> {
    let name = state
        .registry
        .name(req.vm_key)
        .ok_or_else(|| anyhow!("Unknown VM {}", req.vm_key))?;
    let vm = state
        .registry
        .snapshot(req.vm_key)
        .ok_or_else(|| anyhow!("Unknown VM {}", req.vm_key))?;

    if vm.host != req.src_host {
        warn!(
            "{} expected on host {} but recorded on {}",
            name, req.src_host, vm.host
        );
    }
    if vm.local_id != req.local_id {
        debug!(
            "{} local id changed {:?} -> {:?} since the request was made",
            name, req.local_id, vm.local_id
        );
    }

    if vm.cpu_affinity != req.adversary_affinity {
        state
            .hypervisor
            .pin_affinity(req.src_host, name, req.adversary_affinity)
            .with_context(|| {
                format!(
                    "Failed to pin {} to node {} on host {}",
                    name, req.adversary_affinity, req.src_host
                )
            })?;
        state
            .registry
            .with_vm(req.vm_key, |vm| vm.cpu_affinity = req.adversary_affinity);
    }

    let numa_local = req.src_host == req.dest_host;
    state
        .hypervisor
        .migrate(req.src_host, req.dest_host, name, numa_local)
        .with_context(|| {
            format!(
                "Failed to migrate {} from host {} to {}",
                name, req.src_host, req.dest_host
            )
        })?;
    state.registry.relocate(req.vm_key, req.dest_host)?;
    state.registry.with_vm(req.vm_key, |vm| vm.local_id = None);

    let local_id = state
        .hypervisor
        .query_local_id(req.dest_host, name)
        .with_context(|| format!("Failed to look up {} on host {}", name, req.dest_host))?;
    state
        .registry
        .with_vm(req.vm_key, |vm| vm.local_id = Some(local_id));

    info!(
        "{} moved host {} -> {} node {} local id {}",
        name, req.src_host, req.dest_host, req.adversary_affinity, local_id
    );
    Ok(())
}

/// Entry point of a migration crew worker.
pub fn run_worker(worker: Worker<SchedState>) -> Result<()> {
    let state: Arc<SchedState> = worker.shared;
    debug!("migration worker {} started", worker.index);

    while !state.shutdown.load(Ordering::Relaxed) {
        let ticket = match state.migrations.dequeue(&state.shutdown) {
            Some(ticket) => ticket,
            None => break,
        };
        let (vm_key, generation) = (ticket.vm_key, ticket.generation);

        let ok = match execute(&state, &ticket) {
            Ok(()) => {
                state.metrics.migrations_ok.increment(1);
                true
            }
            Err(e) => {
                warn!("Migration of VM {} failed: {:#}", vm_key, e);
                state.metrics.migrations_failed.increment(1);
                false
            }
        };
        state.registry.release(vm_key);

        drop(ticket);
        state.completion.complete(generation, ok);
    }

    debug!("migration worker {} exiting", worker.index);
    Ok(())
}
