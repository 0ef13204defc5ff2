// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cycle protocol
//!
//! A cycle is numbered by its generation, starting at 1, and moves through
//! three handoffs:
//!
//! 1. The local monitors meet at a [`crate::crew::Rendezvous`]; its leader
//!    announces the generation on the [`CycleHandoff`], which wakes the
//!    global rebalancer.
//!
//! 2. The global rebalancer seeds the [`CompletionGroup`] with the exact
//!    number of migration requests it is about to enqueue and waits for the
//!    migration crew to report every one of them.
//!
//! 3. The global rebalancer releases the [`CycleGates`] with the generation,
//!    letting every local monitor into the next cycle.
//!
//! Only one cycle is ever in flight: a new one cannot be announced before
//! the gates of the previous one were released.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::bail;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::SendTimeoutError;
use crossbeam::channel::Sender;
use log::warn;

use crate::crew::POLL_INTERVAL;

struct Gate {
    released: Mutex<u64>,
    cvar: Condvar,
}

/// One gate per host, released by generation.
pub struct CycleGates {
    gates: Vec<Gate>,
}

impl CycleGates {
    pub fn new(nr_hosts: usize) -> Self {
        Self {
            gates: (0..nr_hosts)
                .map(|_| Gate {
                    released: Mutex::new(0),
                    cvar: Condvar::new(),
                })
                .collect(),
        }
    }

    /// Open every gate up to and including `generation`.
    pub fn release_all(&self, generation: u64) {
        for gate in self.gates.iter() {
            let mut released = gate.released.lock().unwrap_or_else(PoisonError::into_inner);
            if *released < generation {
                *released = generation;
            }
            gate.cvar.notify_all();
        }
    }

    /// Block the monitor at `index` until its gate has been released for
    /// `generation`. Returns false on shutdown.
    pub fn wait(&self, index: usize, generation: u64, shutdown: &AtomicBool) -> Result<bool> {
        let gate = match self.gates.get(index) {
            Some(gate) => gate,
            None => bail!("No cycle gate for monitor {}", index),
        };

        let mut released = gate.released.lock().unwrap_or_else(PoisonError::into_inner);
        while *released < generation {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let (guard, _) = gate
                .cvar
                .wait_timeout(released, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            released = guard;
        }
        Ok(true)
    }

    pub fn released(&self, index: usize) -> Option<u64> {
        self.gates
            .get(index)
            .map(|g| *g.released.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Single slot "data ready" signal from the local tier to the global one.
pub struct CycleHandoff {
    tx: Sender<u64>,
    rx: Receiver<u64>,
}

impl CycleHandoff {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    /// Announce that every host reported for `generation`. Returns false on
    /// shutdown.
    pub fn announce(&self, generation: u64, shutdown: &AtomicBool) -> Result<bool> {
        let mut generation = generation;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(false);
            }
            match self.tx.send_timeout(generation, POLL_INTERVAL) {
                Ok(()) => return Ok(true),
                Err(SendTimeoutError::Timeout(g)) => generation = g,
                Err(SendTimeoutError::Disconnected(_)) => bail!("cycle handoff disconnected"),
            }
        }
    }

    /// Wait for the next announced generation. None on shutdown.
    pub fn await_report(&self, shutdown: &AtomicBool) -> Option<u64> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(generation) => return Some(generation),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Default for CycleHandoff {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    pub generation: u64,
    pub issued: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CompletionSummary {
    pub fn drained(&self) -> bool {
        self.completed >= self.issued
    }
}

/// Per-cycle wait group for migration requests.
pub struct CompletionGroup {
    state: Mutex<CompletionSummary>,
    cvar: Condvar,
}

impl CompletionGroup {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompletionSummary::default()),
            cvar: Condvar::new(),
        }
    }

    /// Start counting `issued` requests of cycle `generation`. Must be
    /// called before the first of them is enqueued.
    pub fn begin(&self, generation: u64, issued: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.drained() {
            bail!(
                "cycle {} started while cycle {} has {}/{} completions",
                generation,
                state.generation,
                state.completed,
                state.issued
            );
        }
        if generation <= state.generation {
            bail!(
                "cycle {} started after cycle {}",
                generation,
                state.generation
            );
        }
        *state = CompletionSummary {
            generation,
            issued,
            completed: 0,
            failed: 0,
        };
        Ok(())
    }

    /// Report one request of `generation` done. Stale or surplus reports are
    /// dropped and return false.
    pub fn complete(&self, generation: u64, ok: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if generation != state.generation || state.drained() {
            warn!(
                "Dropping completion for cycle {} (current cycle {}, {}/{})",
                generation, state.generation, state.completed, state.issued
            );
            return false;
        }
        state.completed += 1;
        if !ok {
            state.failed += 1;
        }
        if state.drained() {
            self.cvar.notify_all();
        }
        true
    }

    /// Wait until every request of the current cycle reported. None on
    /// shutdown.
    pub fn wait(&self, shutdown: &AtomicBool) -> Option<CompletionSummary> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.drained() {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Some(*state)
    }

    pub fn summary(&self) -> CompletionSummary {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CompletionGroup {
    fn default() -> Self {
        Self::new()
    }
}
