// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Tunables of the rebalancer. Any field missing from a config file keeps
/// its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// NUMA nodes per host.
    pub nr_nodes: u32,
    /// VMs every node is expected to hold. A sample that does not add up is
    /// discarded.
    pub vms_per_node: usize,
    /// Disjoint socket pairs rebalanced per global cycle.
    pub degree_of_migration: usize,
    /// Minimum pressure gap between two sockets for a swap.
    pub global_llc_threshold: f64,
    /// Miss rate above which the NUMA pass looks at a VM.
    pub numa_threshold: f64,
    /// The NUMA pass runs every this many valid cycles.
    pub numa_period: u64,
    /// Samples with both counters below this are treated as idle.
    pub idle_floor: u64,
    pub llc_miss_scale: f64,
    pub retired_inst_scale: f64,
    /// Cycles a swapped VM pair is held back before it may swap again.
    pub swap_patience: u32,
    /// Seconds a local monitor sleeps between cycles.
    pub local_interval: f64,
    /// Seconds the global rebalancer sleeps after a cycle.
    pub global_interval: f64,
    /// Seconds crews get to wind down after shutdown was requested.
    pub shutdown_grace: f64,
    /// Spread hot VMs across the nodes of each host.
    pub local_balance: bool,
    pub local_llc_threshold: u64,
    pub local_imbalance_threshold: f64,
    /// Re-query the affinity of every VM on each sample.
    pub verify_affinity: bool,
    pub cpus_per_node: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            nr_nodes: 2,
            vms_per_node: 4,
            degree_of_migration: 4,
            global_llc_threshold: 1000.0,
            numa_threshold: 2000.0,
            numa_period: 5,
            idle_floor: 20,
            llc_miss_scale: 10000.0,
            retired_inst_scale: 500000.0,
            swap_patience: 5,
            local_interval: 5.0,
            global_interval: 15.0,
            shutdown_grace: 3.0,
            local_balance: false,
            local_llc_threshold: 50,
            local_imbalance_threshold: 500.0,
            verify_affinity: false,
            cpus_per_node: 4,
        }
    }
}

fn secs(what: &str, v: f64) -> Result<Duration> {
    if !v.is_finite() || v < 0.0 {
        bail!("{} must be a non-negative number of seconds, got {}", what, v);
    }
    Duration::try_from_secs_f64(v)
        .with_context(|| format!("{} of {} seconds is out of range", what, v))
}

impl Tunables {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        parse_config_content(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_nodes == 0 {
            bail!("nr_nodes must be at least 1");
        }
        if self.vms_per_node == 0 {
            bail!("vms_per_node must be at least 1");
        }
        if self.degree_of_migration == 0 {
            bail!("degree_of_migration must be at least 1");
        }
        if self.numa_period == 0 {
            bail!("numa_period must be at least 1");
        }
        if self.cpus_per_node == 0 {
            bail!("cpus_per_node must be at least 1");
        }
        if !(self.retired_inst_scale > 0.0) {
            bail!("retired_inst_scale must be positive");
        }
        secs("local_interval", self.local_interval)?;
        secs("global_interval", self.global_interval)?;
        secs("shutdown_grace", self.shutdown_grace)?;
        Ok(())
    }

    pub fn local_interval(&self) -> Duration {
        secs("local_interval", self.local_interval).unwrap_or_default()
    }

    pub fn global_interval(&self) -> Duration {
        secs("global_interval", self.global_interval).unwrap_or_default()
    }

    pub fn shutdown_grace(&self) -> Duration {
        secs("shutdown_grace", self.shutdown_grace).unwrap_or_default()
    }

    /// Number of (host, node) sockets of a fleet of `nr_hosts`.
    pub fn nr_sockets(&self, nr_hosts: u32) -> usize {
        nr_hosts as usize * self.nr_nodes as usize
    }
}

fn parse_config_content(content: &str) -> Result<Tunables> {
    let tunables: Tunables = toml::from_str(content)?;
    tunables.validate()?;
    Ok(tunables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let tunables = parse_config_content(
            r#"
degree_of_migration = 2
global_interval = 30.0
local_balance = true
"#,
        )
        .expect("Failed to parse config");

        assert_eq!(tunables.degree_of_migration, 2);
        assert_eq!(tunables.global_interval(), Duration::from_secs(30));
        assert!(tunables.local_balance);
        assert_eq!(tunables.nr_nodes, 2);
        assert_eq!(tunables.swap_patience, 5);
        assert_eq!(tunables.local_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(parse_config_content("").unwrap(), Tunables::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(parse_config_content("degree_of_migration = 0").is_err());
        assert!(parse_config_content("local_interval = -1.0").is_err());
        assert!(parse_config_content("nr_nodes = \"two\"").is_err());
        assert!(parse_config_content("numa_period = 0").is_err());
        assert!(parse_config_content("global_interval = 1e30").is_err());
        assert!(parse_config_content("shutdown_grace = inf").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nr_nodes = 4\nvms_per_node = 2").unwrap();
        let tunables = Tunables::load(file.path()).unwrap();
        assert_eq!(tunables.nr_nodes, 4);
        assert_eq!(tunables.nr_sockets(3), 12);

        assert!(Tunables::load(Path::new("/nonexistent/cachemig.toml")).is_err());
    }
}
