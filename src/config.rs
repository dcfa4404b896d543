// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Run configuration, validated as a whole before anything is allocated.

use std::time::Duration;

use log::info;
use nix::sched::CpuSet;

use crate::arena::WorkerId;
use crate::arena::DEFAULT_CAPACITY;
use crate::arena::MAX_WORKERS;
use crate::error::ProfilerError;
use crate::error::Result;
use crate::policy;
use crate::policy::DeadlineParams;
use crate::policy::Policy;
use crate::policy::PolicyTable;
use crate::sync::LockProtocol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadConfig {
    pub id: WorkerId,
    pub policy: Policy,
    pub priority: i32,
}

impl ThreadConfig {
    pub fn timesharing(id: WorkerId) -> Self {
        Self {
            id,
            policy: Policy::Other,
            priority: 0,
        }
    }
}

/// What a worker does when the kernel refuses its policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplyMode {
    /// Abort the whole run before the race starts.
    #[default]
    Strict,
    /// Log it and race with whatever policy the thread ended up with.
    BestEffort,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub capacity: usize,
    pub threads: Vec<ThreadConfig>,
    pub apply_mode: ApplyMode,
    pub deadline: DeadlineParams,
    pub pin_cpu: Option<usize>,
    pub timeout: Option<Duration>,
    pub lock_protocol: LockProtocol,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            threads: vec![],
            apply_mode: ApplyMode::Strict,
            deadline: DeadlineParams::default(),
            pin_cpu: None,
            timeout: None,
            lock_protocol: LockProtocol::Inherit,
        }
    }
}

/// `buffer_size_kb * 1024`, or the 1KiB default when the size is below 1.
pub fn capacity_for(buffer_size_kb: i64) -> Result<usize> {
    if buffer_size_kb < 1 {
        info!("Using default buffer size (1kb).");
        return Ok(DEFAULT_CAPACITY);
    }
    usize::try_from(buffer_size_kb)
        .ok()
        .and_then(|kb| kb.checked_mul(DEFAULT_CAPACITY))
        .ok_or_else(|| {
            ProfilerError::usage(format!("buffer size of {}kb is too large", buffer_size_kb))
        })
}

/// Split trailing `<policy> <priority>` arguments into pairs. Policy names
/// are not resolved here.
pub fn parse_pairs(args: &[String]) -> Result<Vec<(String, i32)>> {
    if args.len() % 2 != 0 {
        return Err(ProfilerError::usage(format!(
            "policy {:?} is missing its priority",
            args[args.len() - 1]
        )));
    }
    args.chunks_exact(2)
        .map(|pair| -> Result<(String, i32)> {
            let priority = pair[1].trim().parse::<i32>().map_err(|_| {
                ProfilerError::usage(format!(
                    "priority {:?} for {} is not an integer",
                    pair[1], pair[0]
                ))
            })?;
            Ok((pair[0].clone(), priority))
        })
        .collect()
}

/// Resolve and validate every worker's policy. Workers without an explicit
/// pair run SCHED_OTHER at priority 0.
pub fn thread_configs(
    thread_count: i64,
    pairs: &[(String, i32)],
    table: &PolicyTable,
) -> Result<Vec<ThreadConfig>> {
    if thread_count < 1 {
        return Err(ProfilerError::usage(
            "At least one thread must be allocated.",
        ));
    }
    if thread_count > MAX_WORKERS as i64 {
        return Err(ProfilerError::usage(format!(
            "at most {} threads are supported",
            MAX_WORKERS
        )));
    }
    let thread_count = thread_count as usize;
    if pairs.len() > thread_count {
        return Err(ProfilerError::usage(format!(
            "{} policy/priority pairs given for {} threads",
            pairs.len(),
            thread_count
        )));
    }

    (0..thread_count)
        .map(|i| -> Result<ThreadConfig> {
            let id = WorkerId::new(i).ok_or_else(|| ProfilerError::usage("too many threads"))?;
            match pairs.get(i) {
                None => Ok(ThreadConfig::timesharing(id)),
                Some((name, priority)) => {
                    let policy = policy::resolve(name)?;
                    table.validate(policy, *priority)?;
                    Ok(ThreadConfig {
                        id,
                        policy,
                        priority: *priority,
                    })
                }
            }
        })
        .collect()
}

impl RunConfig {
    /// Build the thread list and capacity from the positional arguments.
    /// Other knobs keep their defaults.
    pub fn from_args(
        thread_count: i64,
        buffer_size_kb: i64,
        trailing: &[String],
        table: &PolicyTable,
    ) -> Result<Self> {
        let pairs = parse_pairs(trailing)?;
        let threads = thread_configs(thread_count, &pairs, table)?;
        let capacity = capacity_for(buffer_size_kb)?;
        Ok(Self {
            capacity,
            threads,
            ..Self::default()
        })
    }

    /// Checks that depend on more than one field.
    pub fn validate(&self) -> Result<()> {
        if self.threads.is_empty() {
            return Err(ProfilerError::usage(
                "At least one thread must be allocated.",
            ));
        }
        if self.capacity == 0 {
            return Err(ProfilerError::usage("buffer capacity must be at least 1"));
        }
        if let Some(cpu) = self.pin_cpu {
            if cpu >= CpuSet::count() {
                return Err(ProfilerError::usage(format!(
                    "CPU {} is out of range (at most {} CPUs)",
                    cpu,
                    CpuSet::count()
                )));
            }
        }
        if self.threads.iter().any(|t| t.policy == Policy::Deadline) {
            self.deadline.validate()?;
        }
        Ok(())
    }
}
