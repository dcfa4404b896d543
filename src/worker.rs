// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use log::info;
use log::trace;
use log::warn;
use nix::sched::sched_setaffinity;
use nix::sched::sched_yield;
use nix::sched::CpuSet;
use nix::unistd::Pid;
use serde::Serialize;

use crate::arena::Claim;
use crate::arena::ContentionArena;
use crate::arena::WorkerId;
use crate::config::ApplyMode;
use crate::config::RunConfig;
use crate::config::ThreadConfig;
use crate::error::ProfilerError;
use crate::error::Result;
use crate::gate::GateOutcome;
use crate::gate::StartGate;
use crate::policy;
use crate::policy::Policy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    PolicyApplied,
    AwaitingStart,
    Racing,
    Finished,
}

/// Per-worker counters, owned by the worker until it is joined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadStats {
    pub id: WorkerId,
    pub requested_policy: Policy,
    pub requested_priority: i32,
    pub actual_policy: Option<Policy>,
    pub actual_priority: Option<i32>,
    pub writes: usize,
    pub switches: usize,
    /// Length of the longest run of consecutive claims by this worker.
    pub longest_run: usize,
}

impl ThreadStats {
    pub fn new(config: &ThreadConfig) -> Self {
        Self {
            id: config.id,
            requested_policy: config.policy,
            requested_priority: config.priority,
            actual_policy: None,
            actual_priority: None,
            writes: 0,
            switches: 0,
            longest_run: 0,
        }
    }
}

pub struct Worker<'a> {
    config: ThreadConfig,
    run: &'a RunConfig,
    arena: &'a ContentionArena,
    gate: &'a StartGate,
    stop: &'a AtomicBool,
    state: WorkerState,
    stats: ThreadStats,
}

impl<'a> Worker<'a> {
    pub fn new(
        config: ThreadConfig,
        run: &'a RunConfig,
        arena: &'a ContentionArena,
        gate: &'a StartGate,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            stats: ThreadStats::new(&config),
            config,
            run,
            arena,
            gate,
            stop,
            state: WorkerState::Created,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    /// Drive the worker to `Finished` on the calling thread.
    ///
    /// Any failure before the race aborts the start gate so that the other
    /// workers return instead of waiting forever.
    pub fn run(mut self) -> Result<ThreadStats> {
        if let Err(e) = self.apply_policy() {
            self.gate.abort();
            return Err(e);
        }

        self.state = WorkerState::AwaitingStart;
        if self.gate.arrive() == GateOutcome::Aborted {
            debug!(
                "worker {}: start gate aborted in {:?}",
                self.config.id, self.state
            );
            return Err(ProfilerError::Aborted);
        }

        self.state = WorkerState::Racing;
        self.race()?;

        self.state = WorkerState::Finished;
        debug!(
            "worker {}: finished writes={} switches={}",
            self.config.id, self.stats.writes, self.stats.switches
        );
        Ok(self.stats)
    }

    fn apply_policy(&mut self) -> Result<()> {
        let id = self.config.id;

        if let Some(cpu) = self.run.pin_cpu {
            let mut set = CpuSet::new();
            set.set(cpu)
                .map_err(|e| ProfilerError::Affinity(id.symbol(), e))?;
            sched_setaffinity(Pid::from_raw(0), &set)
                .map_err(|e| ProfilerError::Affinity(id.symbol(), e))?;
        }

        let res = policy::apply_to_current_thread(
            self.config.policy,
            self.config.priority,
            &self.run.deadline,
        );
        if let Err(source) = res {
            match self.run.apply_mode {
                ApplyMode::Strict => {
                    return Err(ProfilerError::PolicyApply {
                        worker: id.symbol(),
                        policy: self.config.policy,
                        source,
                    });
                }
                ApplyMode::BestEffort => {
                    warn!(
                        "Thread {}: Failed to set policy {} ({})",
                        id, self.config.policy, source
                    );
                }
            }
        }

        match policy::current_thread_sched() {
            Ok(observed) => {
                self.stats.actual_policy = observed.policy;
                self.stats.actual_priority = Some(observed.priority);
            }
            Err(e) => warn!("Thread {}: cannot read back policy ({})", id, e),
        }

        info!(
            "Thread {} (tid {}): requested policy={} priority={}, actual policy={} priority={}",
            id,
            nix::unistd::gettid(),
            self.config.policy,
            self.config.priority,
            self.stats
                .actual_policy
                .map_or("UNKNOWN", |p| p.name()),
            self.stats
                .actual_priority
                .map_or_else(|| "?".to_string(), |p| p.to_string()),
        );

        self.state = WorkerState::PolicyApplied;
        Ok(())
    }

    fn race(&mut self) -> Result<()> {
        let id = self.config.id;
        // Yield after every claim under SCHED_RR so that slice boundaries
        // show up in the trace.
        let yield_after_claim = self.stats.actual_policy == Some(Policy::RoundRobin);
        let mut run_len = 0;

        while !self.stop.load(Ordering::Relaxed) {
            match self.arena.claim_slot(id)? {
                Claim::Claimed { position, previous } => {
                    self.stats.writes += 1;
                    if previous != Some(id) {
                        self.stats.switches += 1;
                        trace!("worker {}: took over at {} from {:?}", id, position, previous);
                        run_len = 0;
                    }
                    run_len += 1;
                    self.stats.longest_run = self.stats.longest_run.max(run_len);

                    if yield_after_claim {
                        if let Err(e) = sched_yield() {
                            trace!("worker {}: sched_yield failed ({})", id, e);
                        }
                    }
                }
                Claim::Exhausted => break,
            }
        }
        Ok(())
    }
}
