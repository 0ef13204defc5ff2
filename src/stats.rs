// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Result;
use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Histogram;

use crate::fleet::SocketKey;
use crate::fleet::VmKey;

fn signed(x: f64) -> String {
    if x >= 0.0f64 {
        format!("{:+9.1}", x)
    } else {
        format!("{:9.1}", x)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapStat {
    pub high: SocketKey,
    pub low: SocketKey,
    pub high_vm: VmKey,
    pub low_vm: VmKey,
    pub gap: f64,
}

impl SwapStat {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "  SWAP {} VM[{:03}] <-> {} VM[{:03}] gap={}",
            self.high,
            self.high_vm,
            self.low,
            self.low_vm,
            signed(self.gap)
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleStats {
    pub generation: u64,
    pub pressure: BTreeMap<SocketKey, f64>,
    pub swaps: Vec<SwapStat>,
    /// Rejected pairs per reason.
    pub rejected: BTreeMap<String, u64>,
    pub migrations_issued: usize,
    pub migrations_failed: usize,
    pub duration_us: u64,
}

impl CycleStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "CYCLE[{:04}] swaps={} migrations={} failed={} took={}us",
            self.generation,
            self.swaps.len(),
            self.migrations_issued,
            self.migrations_failed,
            self.duration_us
        )?;
        for (socket, pressure) in self.pressure.iter() {
            writeln!(w, "  {} pressure={:10.1}", socket, pressure)?;
        }
        for swap in self.swaps.iter() {
            swap.format(w)?;
        }
        if !self.rejected.is_empty() {
            let rejected: Vec<String> = self
                .rejected
                .iter()
                .map(|(reason, n)| format!("{}={}", reason, n))
                .collect();
            writeln!(w, "  rejected: {}", rejected.join(" "))?;
        }
        Ok(())
    }
}

/// The most recent cycles, oldest first.
pub struct StatsLedger {
    cap: usize,
    cycles: Mutex<VecDeque<CycleStats>>,
}

impl StatsLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            cycles: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, stats: CycleStats) {
        let mut cycles = self.cycles.lock().unwrap_or_else(PoisonError::into_inner);
        if cycles.len() == self.cap {
            cycles.pop_front();
        }
        cycles.push_back(stats);
    }

    pub fn cycles(&self) -> Vec<CycleStats> {
        self.cycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<CycleStats> {
        self.cycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }
}

pub struct Metrics {
    pub cycles: Counter,
    pub swaps_dispatched: Counter,
    pub rejected_same_socket: Counter,
    pub rejected_below_threshold: Counter,
    pub rejected_missing_vm: Counter,
    pub rejected_vm_busy: Counter,
    pub rejected_hysteresis: Counter,
    pub migrations_ok: Counter,
    pub migrations_failed: Counter,
    pub numa_migrations: Counter,
    pub invalid_samples: Counter,
    pub cycle_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles: counter!("cycles_total"),
            swaps_dispatched: counter!("swaps_dispatched_total"),
            rejected_same_socket: counter!("swaps_rejected_total", "reason" => "same_socket"),
            rejected_below_threshold: counter!("swaps_rejected_total", "reason" => "below_threshold"),
            rejected_missing_vm: counter!("swaps_rejected_total", "reason" => "missing_vm"),
            rejected_vm_busy: counter!("swaps_rejected_total", "reason" => "vm_busy"),
            rejected_hysteresis: counter!("swaps_rejected_total", "reason" => "hysteresis"),
            migrations_ok: counter!("migrations_total", "result" => "ok"),
            migrations_failed: counter!("migrations_total", "result" => "failed"),
            numa_migrations: counter!("numa_migrations_total"),
            invalid_samples: counter!("invalid_samples_total"),
            cycle_duration: histogram!("cycle_duration_us"),
        }
    }

    pub fn socket_pressure(&self, socket: SocketKey, pressure: f64) {
        gauge!(
            "socket_pressure",
            "host" => socket.host.to_string(),
            "node" => socket.node.to_string()
        )
        .set(pressure);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
