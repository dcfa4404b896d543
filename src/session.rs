// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::bounded;
use crossbeam::channel::RecvTimeoutError;
use log::debug;
use log::info;

use crate::arena::ContentionArena;
use crate::arena::Trace;
use crate::config::RunConfig;
use crate::error::ProfilerError;
use crate::error::Result;
use crate::gate::StartGate;
use crate::stats;
use crate::stats::Report;
use crate::worker::ThreadStats;
use crate::worker::Worker;

/// Everything one run owns: the arena, the start gate and the stop flag.
///
/// Workers borrow these for the duration of a scoped thread, so nothing
/// outlives the session and separate sessions never share state.
pub struct Session {
    config: RunConfig,
    arena: ContentionArena,
    gate: StartGate,
    stop: AtomicBool,
}

impl Session {
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let arena = ContentionArena::new(config.capacity, config.lock_protocol)?;
        let gate = StartGate::new(config.threads.len());
        if config.pin_cpu.is_none() && config.threads.iter().any(|t| t.policy.is_realtime()) {
            info!("Real-time workers are not pinned; on separate CPUs they never preempt each other (see --pin-cpu)");
        }
        debug!(
            "session: capacity={} workers={} lock={:?}",
            config.capacity,
            config.threads.len(),
            config.lock_protocol
        );
        Ok(Self {
            config,
            arena,
            gate,
            stop: AtomicBool::new(false),
        })
    }

    /// Race all workers to completion and summarize the trace.
    pub fn run(self) -> Result<Report> {
        let started = Instant::now();
        let (results, timed_out) = self.race();

        // Report the worker that caused an abort, not the ones released by it.
        let mut stats = Vec::with_capacity(results.len());
        let mut aborted = false;
        let mut first_err = None;
        for res in results {
            match res {
                Ok(s) => stats.push(s),
                Err(ProfilerError::Aborted) => aborted = true,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        if aborted {
            return Err(ProfilerError::Aborted);
        }

        let timeout = self.config.timeout.unwrap_or_default();
        let trace = settle(self.arena.finish(), timed_out, timeout)?;
        info!(
            "Race over {} slots finished in {:.3}s",
            trace.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(stats::summarize(&trace, &stats))
    }

    fn race(&self) -> (Vec<Result<ThreadStats>>, bool) {
        let (done_tx, done_rx) = bounded::<()>(0);

        thread::scope(|s| {
            let watchdog = self.config.timeout.map(|timeout| {
                let stop = &self.stop;
                s.spawn(move || watchdog(done_rx, timeout, stop))
            });

            let mut handles = Vec::with_capacity(self.config.threads.len());
            let mut results = Vec::new();
            for tc in self.config.threads.iter().copied() {
                let worker = Worker::new(tc, &self.config, &self.arena, &self.gate, &self.stop);
                let spawned = thread::Builder::new()
                    .name(format!("worker-{}", tc.id))
                    .spawn_scoped(s, move || worker.run());
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        // The workers already waiting at the gate would
                        // never be released otherwise.
                        self.gate.abort();
                        results.push(Err(ProfilerError::Spawn(tc.id.symbol(), e)));
                        break;
                    }
                }
            }

            for h in handles {
                results.push(h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)));
            }
            drop(done_tx);

            let timed_out = watchdog
                .map(|h| h.join().unwrap_or(false))
                .unwrap_or(false);
            (results, timed_out)
        })
    }
}

/// A watchdog firing only counts if it left the buffer short. It can fire
/// after the last claim while the workers are still being joined.
fn settle(finished: Result<Trace>, timed_out: bool, timeout: Duration) -> Result<Trace> {
    match finished {
        Err(ProfilerError::Incomplete { .. }) if timed_out => Err(ProfilerError::TimedOut(timeout)),
        Ok(trace) => {
            if timed_out {
                debug!("watchdog fired after the buffer was full, keeping the trace");
            }
            Ok(trace)
        }
        Err(e) => Err(e),
    }
}

/// Raise `stop` if the workers are not done within `timeout`. Returns
/// whether it fired.
fn watchdog(
    done: crossbeam::channel::Receiver<()>,
    timeout: Duration,
    stop: &AtomicBool,
) -> bool {
    match done.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => {
            stop.store(true, Ordering::Relaxed);
            true
        }
        _ => false,
    }
}
