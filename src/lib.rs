// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Scheduling-contention profiler
//!
//! N worker threads, each running under its own Linux scheduling policy
//! and priority, race to claim the positions of a shared buffer one at a
//! time under a single lock. Once the buffer is full, the sequence of
//! owners shows how often and for how long the kernel ran each thread.
//!
//! A run goes through these pieces:
//!
//! - [`PolicyTable`] resolves policy names and checks priorities against
//!   the ranges the kernel reports.
//! - [`ContentionArena`] is the buffer plus cursor and last writer, all
//!   behind one priority-inheriting mutex.
//! - [`Worker`] applies its policy on its own thread, waits at the
//!   [`StartGate`], then claims slots until the arena is exhausted.
//! - [`stats::summarize`] turns the finished [`Trace`] and the per-worker
//!   [`ThreadStats`] into a [`Report`].
//!
//! [`Session`] owns one run end to end.

pub mod arena;
pub mod config;
pub mod error;
pub mod gate;
pub mod policy;
pub mod session;
pub mod stats;
pub mod sync;
pub mod worker;

pub use arena::Claim;
pub use arena::ContentionArena;
pub use arena::Trace;
pub use arena::WorkerId;
pub use config::ApplyMode;
pub use config::RunConfig;
pub use config::ThreadConfig;
pub use error::ProfilerError;
pub use gate::GateOutcome;
pub use gate::StartGate;
pub use policy::Policy;
pub use policy::PolicyTable;
pub use policy::PriorityRange;
pub use session::Session;
pub use stats::Report;
pub use sync::LockProtocol;
pub use worker::ThreadStats;
pub use worker::Worker;
