// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Hypervisor control
//!
//! Everything the rebalancer knows about hosts and VMs comes through the
//! [`Hypervisor`] trait: one call is one synchronous, blocking operation
//! against one host, and any call may fail. Callers treat a failure as "no
//! data this cycle" and never abort on it.
//!
//! [`SshHypervisor`] drives a Xen toolstack by running one remote command
//! per call over ssh. Hosts are addressed as `{prefix}{host:02}`, with host
//! IDs starting at 1.
use std::process::Command;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::trace;

use crate::fleet::HostId;
use crate::fleet::NodeId;

/// One row of a counter sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmSample {
    pub local_id: u32,
    pub retired_insts: u64,
    pub llc_misses: u64,
}

/// A VM as found on a host at discovery time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmDescriptor {
    pub name: String,
    pub local_id: u32,
    pub cpu_affinity: NodeId,
}

/// Memory pages of a VM per NUMA node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NumaResidency {
    pub pages: Vec<u64>,
}

impl NumaResidency {
    /// True if the VM has memory on `node` and none anywhere else.
    pub fn fully_on(&self, node: NodeId) -> bool {
        let node = node as usize;
        match self.pages.get(node) {
            Some(&pages) if pages > 0 => self
                .pages
                .iter()
                .enumerate()
                .all(|(i, &p)| i == node || p == 0),
            _ => false,
        }
    }
}

pub trait Hypervisor: Send + Sync {
    /// Enumerate the guest VMs of `host`, Domain-0 excluded.
    fn discover(&self, host: HostId) -> Result<Vec<VmDescriptor>>;

    /// Called once by a host's local monitor before its first sample.
    fn start_sampling(&self, _host: HostId) -> Result<()> {
        Ok(())
    }

    /// Called once by a host's local monitor on the way out.
    fn stop_sampling(&self, _host: HostId) -> Result<()> {
        Ok(())
    }

    /// Current counter snapshot of every VM on `host`. May include rows
    /// that match no guest (Domain-0); callers skip those.
    fn list_resident_vms(&self, host: HostId) -> Result<Vec<VmSample>>;

    fn query_affinity(&self, host: HostId, name: &str) -> Result<NodeId>;

    /// The hypervisor-local id of `name` on `host`. Changes on every
    /// migration.
    fn query_local_id(&self, host: HostId, name: &str) -> Result<u32>;

    fn pin_affinity(&self, host: HostId, name: &str, node: NodeId) -> Result<()>;

    /// Live-migrate `name` from `src` to `dest`. `numa_local` requests a
    /// NUMA-aware move and is set when `src == dest`.
    fn migrate(&self, src: HostId, dest: HostId, name: &str, numa_local: bool) -> Result<()>;

    fn query_numa_residency(&self, host: HostId, local_id: u32) -> Result<NumaResidency>;
}

const SAMPLE_CMD: &str = "xenonmon-do.py Inst_LLC -t 7200 -n 1";
const SAMPLE_SET_CMD: &str = "xenonmon-set.py Inst_LLC -t 7200 -n 1";
const SAMPLE_UNSET_CMD: &str = "xenonmon-unset.py Inst_LLC -t 7200 -n 1";

pub struct SshHypervisor {
    prefix: String,
    nr_nodes: u32,
    cpus_per_node: u32,
}

impl SshHypervisor {
    pub fn new(prefix: &str, nr_nodes: u32, cpus_per_node: u32) -> Result<Self> {
        if prefix.is_empty() {
            bail!("Host prefix must not be empty");
        }
        if cpus_per_node == 0 {
            bail!("cpus_per_node must be positive");
        }
        Ok(Self {
            prefix: prefix.to_string(),
            nr_nodes,
            cpus_per_node,
        })
    }

    pub fn host_addr(&self, host: HostId) -> String {
        format!("{}{:02}", self.prefix, host)
    }

    fn run(&self, host: HostId, cmd: &str) -> Result<String> {
        let addr = self.host_addr(host);
        trace!("[{}] $ {}", addr, cmd);

        let output = Command::new("ssh")
            .arg(&addr)
            .arg(cmd)
            .output()
            .with_context(|| format!("Failed to run ssh to {}", addr))?;
        if !output.status.success() {
            bail!(
                "`{}` on {} exited with {}: {}",
                cmd,
                addr,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Non UTF-8 output from `{}` on {}", cmd, addr))
    }
}

impl Hypervisor for SshHypervisor {
    fn discover(&self, host: HostId) -> Result<Vec<VmDescriptor>> {
        let listed = parse_xl_list(&self.run(host, "xl list")?)?;
        let mut vms = Vec::with_capacity(listed.len());
        for (name, local_id) in listed {
            let cpu_affinity = self.query_affinity(host, &name)?;
            vms.push(VmDescriptor {
                name,
                local_id,
                cpu_affinity,
            });
        }
        Ok(vms)
    }

    fn start_sampling(&self, host: HostId) -> Result<()> {
        self.run(host, SAMPLE_SET_CMD).map(|_| ())
    }

    fn stop_sampling(&self, host: HostId) -> Result<()> {
        self.run(host, SAMPLE_UNSET_CMD).map(|_| ())
    }

    fn list_resident_vms(&self, host: HostId) -> Result<Vec<VmSample>> {
        parse_samples(&self.run(host, SAMPLE_CMD)?)
    }

    fn query_affinity(&self, host: HostId, name: &str) -> Result<NodeId> {
        let cmd = format!("xl vcpu-list | grep -w {} | awk '{{print $7}}'", name);
        let out = self.run(host, &cmd)?;
        let node = parse_affinity(&out, self.cpus_per_node)?;
        if node >= self.nr_nodes {
            bail!("{} on host {} is pinned to unknown node {}", name, host, node);
        }
        Ok(node)
    }

    fn query_local_id(&self, host: HostId, name: &str) -> Result<u32> {
        let cmd = format!("xm list | grep -w {} | awk '{{print $2}}'", name);
        let out = self.run(host, &cmd)?;
        out.trim()
            .parse()
            .with_context(|| format!("Bad local id {:?} for {} on host {}", out.trim(), name, host))
    }

    fn pin_affinity(&self, host: HostId, name: &str, node: NodeId) -> Result<()> {
        let cmd = format!(
            "xm vcpu-pin {} 0 {}",
            name,
            affinity_range(node, self.cpus_per_node)
        );
        self.run(host, &cmd).map(|_| ())
    }

    fn migrate(&self, src: HostId, dest: HostId, name: &str, numa_local: bool) -> Result<()> {
        let cmd = format!(
            "xm migrate -l {}{} {}",
            if numa_local { "-n 1 " } else { "" },
            name,
            self.host_addr(dest)
        );
        self.run(src, &cmd).map(|_| ())
    }

    fn query_numa_residency(&self, host: HostId, local_id: u32) -> Result<NumaResidency> {
        let out = self.run(host, &format!("./getNUMA-affinity.sh {}", local_id))?;
        parse_residency(&out, self.nr_nodes)
    }
}

/// Parse `xl list`: skip the header and Domain-0, return (name, local id).
pub fn parse_xl_list(out: &str) -> Result<Vec<(String, u32)>> {
    let mut vms = vec![];
    for line in out.lines() {
        let mut fields = line.split_whitespace();
        let (name, id) = match (fields.next(), fields.next()) {
            (Some(name), Some(id)) => (name, id),
            _ => continue,
        };
        if name == "Name" || name == "Domain-0" {
            continue;
        }
        let id = id
            .parse()
            .with_context(|| format!("Bad domain id in `xl list` line {:?}", line))?;
        vms.push((name.to_string(), id));
    }
    Ok(vms)
}

/// Map a vcpu affinity like `4-7` to its node.
pub fn parse_affinity(out: &str, cpus_per_node: u32) -> Result<NodeId> {
    let range = out.trim();
    let (first, last) = match range.split_once('-') {
        Some((a, b)) => (a, b),
        None => (range, range),
    };
    let first: u32 = first
        .parse()
        .with_context(|| format!("Unexpected vcpu affinity {:?}", range))?;
    let last: u32 = last
        .parse()
        .with_context(|| format!("Unexpected vcpu affinity {:?}", range))?;

    if first > last || first / cpus_per_node != last / cpus_per_node {
        bail!("vcpu affinity {:?} spans more than one node", range);
    }
    Ok(first / cpus_per_node)
}

/// The pCPU range of `node`, as `xm vcpu-pin` takes it.
pub fn affinity_range(node: NodeId, cpus_per_node: u32) -> String {
    let first = node * cpus_per_node;
    format!("{}-{}", first, first + cpus_per_node - 1)
}

/// Parse `localID retired llcMisses` lines. Domain-0 (id 0) is dropped.
pub fn parse_samples(out: &str) -> Result<Vec<VmSample>> {
    let mut samples = vec![];
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            bail!("Short sample line {:?}", line);
        }
        let parse = |s: &str| -> Result<u64> {
            s.parse()
                .with_context(|| format!("Bad sample field {:?} in {:?}", s, line))
        };
        let local_id: u32 = fields[0]
            .parse()
            .with_context(|| format!("Bad local id {:?} in {:?}", fields[0], line))?;
        if local_id == 0 {
            continue;
        }
        samples.push(VmSample {
            local_id,
            retired_insts: parse(fields[1])?,
            llc_misses: parse(fields[2])?,
        });
    }
    Ok(samples)
}

/// Parse the page counts per node from the first line of the residency
/// script output.
pub fn parse_residency(out: &str, nr_nodes: u32) -> Result<NumaResidency> {
    let line = out.lines().next().unwrap_or("");
    let pages = line
        .split_whitespace()
        .take(nr_nodes as usize)
        .map(|s| {
            s.parse::<u64>()
                .with_context(|| format!("Bad page count {:?}", s))
        })
        .collect::<Result<Vec<u64>>>()?;
    if pages.len() != nr_nodes as usize {
        bail!("Expected {} page counts, got {:?}", nr_nodes, line);
    }
    Ok(NumaResidency { pages })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xl_list() {
        let out = "\
Name                                        ID   Mem VCPUs      State   Time(s)
Domain-0                                     0  2048     8     r-----   1234.5
vm-a                                         3  1024     4     -b----     12.0
vm-b                                        11  1024     4     r-----     55.1
";
        let vms = parse_xl_list(out).unwrap();
        assert_eq!(vms, vec![("vm-a".to_string(), 3), ("vm-b".to_string(), 11)]);
        assert!(parse_xl_list("vm-c x\n").is_err());
    }

    #[test]
    fn test_affinity() {
        assert_eq!(parse_affinity("0-3\n", 4).unwrap(), 0);
        assert_eq!(parse_affinity("4-7\n", 4).unwrap(), 1);
        assert_eq!(parse_affinity("5", 4).unwrap(), 1);
        assert!(parse_affinity("2-5", 4).is_err());
        assert!(parse_affinity("all", 4).is_err());
        assert_eq!(affinity_range(1, 4), "4-7");
        assert_eq!(affinity_range(0, 4), "0-3");
    }

    #[test]
    fn test_parse_samples() {
        let out = "0 999999 99999\n3 1000000 100000\n\n11 15 15\n";
        let samples = parse_samples(out).unwrap();
        assert_eq!(
            samples,
            vec![
                VmSample {
                    local_id: 3,
                    retired_insts: 1_000_000,
                    llc_misses: 100_000
                },
                VmSample {
                    local_id: 11,
                    retired_insts: 15,
                    llc_misses: 15
                },
            ]
        );
        assert!(parse_samples("3 12\n").is_err());
        assert!(parse_samples("3 12 x\n").is_err());
        assert!(parse_samples("4294967296 5 5\n").is_err());
        assert!(parse_samples("4294967299 5 5\n").is_err());
    }

    #[test]
    fn test_residency() {
        let r = parse_residency("262144 0\n", 2).unwrap();
        assert!(r.fully_on(0));
        assert!(!r.fully_on(1));

        let r = parse_residency("131072 131072", 2).unwrap();
        assert!(!r.fully_on(0));
        assert!(!r.fully_on(1));

        assert!(!NumaResidency { pages: vec![0, 0] }.fully_on(0));
        assert!(parse_residency("12\n", 2).is_err());
    }

    #[test]
    fn test_host_addr() {
        let hv = SshHypervisor::new("xen", 2, 4).unwrap();
        assert_eq!(hv.host_addr(3), "xen03");
        assert!(SshHypervisor::new("", 2, 4).is_err());
    }
}
