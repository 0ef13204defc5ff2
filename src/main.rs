// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use cachemig::hypervisor::SshHypervisor;
use cachemig::sim::SimHypervisor;
use cachemig::Hypervisor;
use cachemig::LogRecorderBuilder;
use cachemig::Scheduler;
use cachemig::Tunables;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

/// cachemig: cache-contention aware VM rebalancer
///
/// A local monitor per host samples the last-level-cache misses of every
/// VM and sums them into per-socket pressure. Once all hosts reported, a
/// global rebalancer picks up to --degree-of-migration disjoint pairs of
/// the most and least pressured sockets of the fleet and swaps the hottest
/// VM of the one with the coldest VM of the other. A pool of migration
/// workers carries the swaps out and the next cycle starts when they are
/// done.
///
/// Every few cycles (numa_period in the config file), a host also migrates
/// the hottest VM of each node in place when its memory is spread over
/// several NUMA nodes.
#[derive(Debug, Parser)]
struct Opts {
    /// Host name prefix. Host N is addressed as <PREFIX>NN.
    host_prefix: String,

    /// Number of hosts, addressed 1 to NUM_HOSTS.
    num_hosts: u32,

    /// Number of socket pairs rebalanced per global cycle. Overrides the
    /// config file.
    #[clap(short = 'd', long)]
    degree_of_migration: Option<usize>,

    /// TOML file with tunables. Missing fields keep their defaults.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Global rebalancing interval in seconds. Overrides the config file.
    #[clap(short = 'i', long)]
    interval: Option<f64>,

    /// Local monitoring interval in seconds. Overrides the config file.
    #[clap(short = 'I', long)]
    local_interval: Option<f64>,

    /// Run against an in-memory fleet with synthetic workloads instead of
    /// real hosts.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    simulate: bool,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Interval in seconds between metric reports in the log, when the
    /// Prometheus endpoint is disabled.
    #[clap(long, default_value = "3.0")]
    stats_interval: f64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn tunables(opts: &Opts) -> Result<Tunables> {
    let mut tunables = match &opts.config {
        Some(path) => Tunables::load(path)?,
        None => Tunables::default(),
    };
    if let Some(degree) = opts.degree_of_migration {
        tunables.degree_of_migration = degree;
    }
    if let Some(interval) = opts.interval {
        tunables.global_interval = interval;
    }
    if let Some(interval) = opts.local_interval {
        tunables.local_interval = interval;
    }
    tunables.validate()?;
    Ok(tunables)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let tunables = tunables(&opts)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    } else {
        let interval = Duration::try_from_secs_f64(opts.stats_interval)
            .context("Invalid --stats-interval")?;
        LogRecorderBuilder::new()
            .with_reporting_interval(interval)
            .with_shutdown(shutdown.clone())
            .install()?;
    }

    let hypervisor: Arc<dyn Hypervisor> = if opts.simulate {
        info!(
            "Simulating {} hosts x {} nodes x {} VMs",
            opts.num_hosts, tunables.nr_nodes, tunables.vms_per_node
        );
        Arc::new(SimHypervisor::with_workloads(
            opts.num_hosts,
            tunables.nr_nodes,
            tunables.vms_per_node,
        ))
    } else {
        Arc::new(SshHypervisor::new(
            &opts.host_prefix,
            tunables.nr_nodes,
            tunables.cpus_per_node,
        )?)
    };

    let sched = Scheduler::init(tunables, hypervisor, opts.num_hosts, shutdown)?;
    sched.run()
}
