// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Worker crews
//!
//! Every tier of the rebalancer is a crew: a fixed number of named threads
//! running the same entry point over a shared state. A crew can be paired
//! with a [`WorkQueue`] for producer/consumer work (the migration crew) or
//! with a [`Rendezvous`] for end-of-cycle synchronization between peers (the
//! local monitors).
//!
//! Nothing here is ever forcibly cancelled. Every blocking wait is bounded
//! by [`POLL_INTERVAL`] and re-checks the shutdown flag it was handed, so a
//! worker always leaves at a point of its own choosing.
use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::warn;

/// Upper bound on how long any wait sleeps before looking at the shutdown
/// flag again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep for `dur` in slices of at most [`POLL_INTERVAL`]. Returns false if
/// the sleep was cut short by `shutdown`.
pub fn sleep_unless_shutdown(shutdown: &AtomicBool, dur: Duration) -> bool {
    let deadline = Instant::now() + dur;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}

/// FIFO queue feeding a crew.
///
/// `outstanding` counts items that were enqueued and not yet finished, so it
/// covers both queued and in-flight work. It drops when the [`WorkTicket`]
/// handed out by [`WorkQueue::dequeue`] is dropped, not when the item leaves
/// the queue.
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    outstanding: AtomicUsize,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Append `item` to the tail. Never blocks.
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            bail!("work queue disconnected");
        }
        Ok(())
    }

    /// Wait for the head item. Returns None once `shutdown` is set.
    pub fn dequeue(&self, shutdown: &AtomicBool) -> Option<WorkTicket<'_, T>> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(item) => {
                    return Some(WorkTicket {
                        item,
                        outstanding: &self.outstanding,
                    })
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Number of items waiting in the queue.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Number of items queued or being worked on.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An item taken off a [`WorkQueue`]. Dropping it marks the item finished.
pub struct WorkTicket<'a, T> {
    item: T,
    outstanding: &'a AtomicUsize,
}

impl<T> Deref for WorkTicket<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> Drop for WorkTicket<'_, T> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RendezvousState {
    arrived: usize,
    generation: u64,
}

/// Cyclic barrier for a fixed number of parties.
pub struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    cvar: Condvar,
}

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(RendezvousState {
                arrived: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until all parties arrived. Exactly one caller per round gets
    /// `Some(true)` (the leader, the last to arrive), the rest `Some(false)`.
    /// If `shutdown` is set while waiting, the caller withdraws its arrival
    /// and gets None.
    pub fn wait(&self, shutdown: &AtomicBool) -> Option<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation;

        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Some(true);
        }

        loop {
            let (guard, _) = self
                .cvar
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if state.generation != generation {
                return Some(false);
            }
            if shutdown.load(Ordering::Relaxed) {
                state.arrived -= 1;
                return None;
            }
        }
    }
}

/// What a crew worker gets handed: its index within the crew and the state
/// shared by the whole crew.
pub struct Worker<S> {
    pub index: usize,
    pub shared: Arc<S>,
}

pub struct Crew {
    name: String,
    handles: Vec<thread::JoinHandle<Result<()>>>,
}

impl Crew {
    /// Spawn `size` threads named `{name}-{index}`, each running `entry`.
    pub fn spawn<S, F>(name: &str, size: usize, shared: Arc<S>, entry: F) -> Result<Self>
    where
        S: Send + Sync + 'static,
        F: Fn(Worker<S>) -> Result<()> + Send + Sync + 'static,
    {
        if size == 0 {
            bail!("crew {} needs at least one worker", name);
        }

        let entry = Arc::new(entry);
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let entry = entry.clone();
            let worker = Worker {
                index,
                shared: shared.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || (*entry)(worker))
                .with_context(|| format!("Failed to spawn {}-{}", name, index))?;
            handles.push(handle);
        }
        debug!("crew {}: {} workers started", name, size);

        Ok(Self {
            name: name.to_string(),
            handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Whether at least one worker has returned.
    pub fn any_finished(&self) -> bool {
        self.handles.iter().any(|h| h.is_finished())
    }

    /// Poll until every worker has returned or `timeout` passed. Returns
    /// whether the crew finished.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
        true
    }

    /// Wait for every worker and report the first failure.
    pub fn join(self) -> Result<()> {
        let mut first_err = None;
        for (index, handle) in self.handles.into_iter().enumerate() {
            let res = match handle.join() {
                Ok(res) => res,
                Err(_) => Err(anyhow!("{}-{} panicked", self.name, index)),
            };
            if let Err(e) = res {
                warn!("{}-{} failed: {:#}", self.name, index, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.context(format!("crew {} failed", self.name))),
            None => Ok(()),
        }
    }
}
