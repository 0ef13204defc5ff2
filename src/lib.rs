// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # cachemig
//!
//! A three tier rebalancer that moves virtual machines between the NUMA
//! sockets of a fleet of hosts to even out last-level-cache pressure.
//!
//! 1. One local monitor per host samples the LLC counters of every resident
//!    VM, aggregates them into per-socket pressure and remembers the hottest
//!    and coldest VM of each socket.
//!
//! 2. Once every host has reported, the single global rebalancer picks up to
//!    `degree_of_migration` disjoint (hot, cold) socket pairs and swaps one VM
//!    of each pair.
//!
//! 3. The migration crew executes the swaps against the hypervisor and
//!    reports back. Only then are the local monitors released into the next
//!    cycle.
//!
//! All tiers are built on the [`crew`] primitives and share one
//! [`scheduler::SchedState`].
pub mod config;
pub mod crew;
pub mod cycle;
pub mod fleet;
pub mod global;
pub mod hypervisor;
pub mod local;
pub mod log_recorder;
pub mod migration;
pub mod pressure;
pub mod scheduler;
pub mod sim;
pub mod stats;

pub use config::Tunables;
pub use hypervisor::Hypervisor;
pub use log_recorder::LogRecorderBuilder;
pub use scheduler::SchedState;
pub use scheduler::Scheduler;
