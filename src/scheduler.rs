// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;

use crate::config::Tunables;
use crate::crew::Crew;
use crate::crew::Rendezvous;
use crate::crew::WorkQueue;
use crate::crew::Worker;
use crate::crew::POLL_INTERVAL;
use crate::cycle::CompletionGroup;
use crate::cycle::CycleGates;
use crate::cycle::CycleHandoff;
use crate::fleet::FleetRegistry;
use crate::global;
use crate::hypervisor::Hypervisor;
use crate::local;
use crate::migration;
use crate::migration::MigrationRequest;
use crate::pressure::HotColdTable;
use crate::pressure::PressureMap;
use crate::stats::Metrics;
use crate::stats::StatsLedger;

const STATS_HISTORY: usize = 64;

/// Everything the three crews share. Built once per run.
pub struct SchedState {
    pub tunables: Tunables,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub registry: FleetRegistry,
    pub pressure: PressureMap,
    pub hot_cold: HotColdTable,
    pub gates: CycleGates,
    pub rendezvous: Rendezvous,
    pub handoff: CycleHandoff,
    pub completion: CompletionGroup,
    pub migrations: WorkQueue<MigrationRequest>,
    pub stats: StatsLedger,
    pub metrics: Metrics,
    pub shutdown: Arc<AtomicBool>,
}

impl SchedState {
    /// Validate `tunables` and discover the VMs of hosts `1..=nr_hosts`.
    pub fn new(
        tunables: Tunables,
        hypervisor: Arc<dyn Hypervisor>,
        nr_hosts: u32,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        tunables.validate()?;
        if nr_hosts == 0 {
            bail!("At least one host is required");
        }

        let registry = FleetRegistry::discover(hypervisor.as_ref(), nr_hosts, tunables.nr_nodes)?;
        let nr_nodes = tunables.nr_nodes;

        Ok(Self {
            hypervisor,
            registry,
            pressure: PressureMap::new(),
            hot_cold: HotColdTable::new(nr_hosts, nr_nodes),
            gates: CycleGates::new(nr_hosts as usize),
            rendezvous: Rendezvous::new(nr_hosts as usize),
            handoff: CycleHandoff::new(),
            completion: CompletionGroup::new(),
            migrations: WorkQueue::new(),
            stats: StatsLedger::new(STATS_HISTORY),
            metrics: Metrics::new(),
            shutdown,
            tunables,
        })
    }

    pub fn nr_hosts(&self) -> u32 {
        self.registry.nr_hosts()
    }
}

pub struct Scheduler {
    state: Arc<SchedState>,
    crews: Vec<Crew>,
}

impl Scheduler {
    pub fn init(
        tunables: Tunables,
        hypervisor: Arc<dyn Hypervisor>,
        nr_hosts: u32,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let state = Arc::new(SchedState::new(tunables, hypervisor, nr_hosts, shutdown)?);
        let nr_migrators = 2 * state.tunables.degree_of_migration;

        let entries: [(&str, usize, fn(Worker<SchedState>) -> Result<()>); 3] = [
            ("migration", nr_migrators, migration::run_worker),
            ("global", 1, global::run_worker),
            ("local", nr_hosts as usize, local::run_worker),
        ];

        let mut crews = vec![];
        for (name, size, entry) in entries {
            match Crew::spawn(name, size, state.clone(), entry) {
                Ok(crew) => crews.push(crew),
                Err(e) => {
                    state.shutdown.store(true, Ordering::Relaxed);
                    for crew in crews {
                        let _ = crew.join();
                    }
                    return Err(e).context("Failed to start crews");
                }
            }
        }

        info!(
            "Rebalancing {} VMs on {} hosts x {} nodes, degree of migration {}",
            state.registry.len(),
            nr_hosts,
            state.tunables.nr_nodes,
            state.tunables.degree_of_migration
        );
        Ok(Self { state, crews })
    }

    pub fn state(&self) -> &Arc<SchedState> {
        &self.state
    }

    /// Run until the shutdown flag is set or a crew gives up, then stop.
    pub fn run(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();
        while !shutdown.load(Ordering::Relaxed) {
            if let Some(crew) = self.crews.iter().find(|c| c.any_finished()) {
                warn!("a {} worker stopped, shutting down", crew.name());
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        self.shutdown()
    }

    /// Set the shutdown flag, give the crews the grace period to wind down
    /// and join them.
    pub fn shutdown(self) -> Result<()> {
        self.state.shutdown.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + self.state.tunables.shutdown_grace();
        for crew in self.crews.iter() {
            let left = deadline.saturating_duration_since(Instant::now());
            if !crew.wait_finished(left) {
                warn!("crew {} still running after the grace period", crew.name());
            }
        }

        let mut res = Ok(());
        for crew in self.crews {
            if let Err(e) = crew.join() {
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        info!("Stopped");
        res
    }
}
