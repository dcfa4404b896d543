// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Linux scheduling policies and the OS calls that read and apply them.
//!
//! [`Policy`] is the closed set of classes a worker can request. The
//! [`PolicyTable`] maps each of them to its OS identifier and holds the
//! priority range reported by the running kernel, queried once per process.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ProfilerError;
use crate::error::Result;

/// Not exported by every libc target.
pub const SCHED_DEADLINE: libc::c_int = 6;

/// Out-of-tree extension class. On mainline kernels the same number is
/// taken by SCHED_EXT, so whether it is accepted depends on the kernel.
pub const SCHED_LOW_IDLE: libc::c_int = 7;

/// Size of the kernel's `struct sched_attr` (SCHED_ATTR_SIZE_VER1).
const SCHED_ATTR_SIZE: u32 = 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Policy {
    #[serde(rename = "SCHED_OTHER")]
    Other,
    #[serde(rename = "SCHED_FIFO")]
    Fifo,
    #[serde(rename = "SCHED_RR")]
    RoundRobin,
    #[serde(rename = "SCHED_BATCH")]
    Batch,
    #[serde(rename = "SCHED_IDLE")]
    Idle,
    #[serde(rename = "SCHED_DEADLINE")]
    Deadline,
    #[serde(rename = "SCHED_LOW_IDLE")]
    LowIdle,
}

impl Policy {
    pub const ALL: [Policy; 7] = [
        Policy::Other,
        Policy::Fifo,
        Policy::RoundRobin,
        Policy::Batch,
        Policy::Idle,
        Policy::Deadline,
        Policy::LowIdle,
    ];

    pub fn os_id(self) -> libc::c_int {
        match self {
            Policy::Other => libc::SCHED_OTHER,
            Policy::Fifo => libc::SCHED_FIFO,
            Policy::RoundRobin => libc::SCHED_RR,
            Policy::Batch => libc::SCHED_BATCH,
            Policy::Idle => libc::SCHED_IDLE,
            Policy::Deadline => SCHED_DEADLINE,
            Policy::LowIdle => SCHED_LOW_IDLE,
        }
    }

    /// Map a value returned by `sched_getscheduler(2)` back to a policy.
    pub fn from_os_id(id: libc::c_int) -> Option<Policy> {
        let id = id & !libc::SCHED_RESET_ON_FORK;
        Self::ALL.into_iter().find(|p| p.os_id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::Other => "SCHED_OTHER",
            Policy::Fifo => "SCHED_FIFO",
            Policy::RoundRobin => "SCHED_RR",
            Policy::Batch => "SCHED_BATCH",
            Policy::Idle => "SCHED_IDLE",
            Policy::Deadline => "SCHED_DEADLINE",
            Policy::LowIdle => "SCHED_LOW_IDLE",
        }
    }

    pub fn is_realtime(self) -> bool {
        matches!(self, Policy::Fifo | Policy::RoundRobin | Policy::Deadline)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Policy {
    type Err = ProfilerError;

    /// Accepts the kernel names with or without the `SCHED_` prefix, in any
    /// case, plus a few descriptive aliases.
    fn from_str(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase().replace('-', "_");
        let short = upper.strip_prefix("SCHED_").unwrap_or(&upper);
        let policy = match short {
            "OTHER" | "NORMAL" | "TIMESHARING" => Policy::Other,
            "FIFO" => Policy::Fifo,
            "RR" | "ROUND_ROBIN" | "ROUNDROBIN" => Policy::RoundRobin,
            "BATCH" => Policy::Batch,
            "IDLE" => Policy::Idle,
            "DEADLINE" => Policy::Deadline,
            "LOW_IDLE" | "LOWIDLE" => Policy::LowIdle,
            _ => return Err(ProfilerError::InvalidPolicy(name.to_string())),
        };
        Ok(policy)
    }
}

pub fn resolve(name: &str) -> Result<Policy> {
    name.parse()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    pub min: i32,
    pub max: i32,
}

impl PriorityRange {
    pub fn contains(&self, priority: i32) -> bool {
        (self.min..=self.max).contains(&priority)
    }
}

impl fmt::Display for PriorityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

fn query_range(policy: Policy) -> io::Result<PriorityRange> {
    let min = unsafe { libc::sched_get_priority_min(policy.os_id()) };
    if min == -1 {
        return Err(io::Error::last_os_error());
    }
    let max = unsafe { libc::sched_get_priority_max(policy.os_id()) };
    if max == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(PriorityRange { min, max })
}

/// Policy -> priority range, as reported by the kernel.
///
/// A policy whose range query failed is kept with the errno so that the
/// error can be reported against the worker that asked for it.
#[derive(Debug)]
pub struct PolicyTable {
    ranges: [std::result::Result<PriorityRange, i32>; Policy::ALL.len()],
}

impl PolicyTable {
    pub fn query() -> Self {
        let ranges = Policy::ALL.map(|p| {
            query_range(p).map_err(|e| e.raw_os_error().unwrap_or(libc::EINVAL))
        });
        Self { ranges }
    }

    /// Build a table from fixed ranges. Policies not listed are treated as
    /// unsupported.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (Policy, PriorityRange)>) -> Self {
        let mut table = Self {
            ranges: [Err(libc::EINVAL); Policy::ALL.len()],
        };
        for (policy, range) in ranges {
            table.ranges[policy.index()] = Ok(range);
        }
        table
    }

    pub fn priority_range(&self, policy: Policy) -> Result<PriorityRange> {
        self.ranges[policy.index()].map_err(|errno| {
            ProfilerError::UnsupportedPolicy(policy, io::Error::from_raw_os_error(errno))
        })
    }

    pub fn validate(&self, policy: Policy, priority: i32) -> Result<()> {
        let range = self.priority_range(policy)?;
        if !range.contains(priority) {
            return Err(ProfilerError::PriorityOutOfRange {
                policy,
                priority,
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (Policy, Option<PriorityRange>)> + '_ {
        Policy::ALL
            .into_iter()
            .map(|p| (p, self.ranges[p.index()].ok()))
    }
}

/// Runtime parameters handed to `sched_setattr(2)` for SCHED_DEADLINE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadlineParams {
    pub runtime: Duration,
    pub deadline: Duration,
    pub period: Duration,
}

impl Default for DeadlineParams {
    fn default() -> Self {
        Self {
            runtime: Duration::from_millis(5),
            deadline: Duration::from_millis(10),
            period: Duration::from_millis(10),
        }
    }
}

impl DeadlineParams {
    /// The kernel requires runtime <= deadline <= period and a runtime of
    /// at least 1024ns.
    pub fn validate(&self) -> Result<()> {
        if self.runtime < Duration::from_nanos(1024) {
            return Err(ProfilerError::usage(
                "deadline runtime must be at least 1024ns",
            ));
        }
        if self.runtime > self.deadline || self.deadline > self.period {
            return Err(ProfilerError::usage(format!(
                "deadline parameters must satisfy runtime <= deadline <= period (got {:?} / {:?} / {:?})",
                self.runtime, self.deadline, self.period
            )));
        }
        Ok(())
    }
}

/// Linux `struct sched_attr`, field layout matching the kernel.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
    sched_util_min: u32,
    sched_util_max: u32,
}

fn sched_setattr(attr: &SchedAttr) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_sched_setattr,
            0 as libc::c_long,
            attr as *const SchedAttr as libc::c_long,
            0 as libc::c_long,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Apply `policy`/`priority` to the calling thread.
pub fn apply_to_current_thread(
    policy: Policy,
    priority: i32,
    deadline: &DeadlineParams,
) -> io::Result<()> {
    if policy == Policy::Deadline {
        let attr = SchedAttr {
            size: SCHED_ATTR_SIZE,
            sched_policy: SCHED_DEADLINE as u32,
            sched_runtime: deadline.runtime.as_nanos() as u64,
            sched_deadline: deadline.deadline.as_nanos() as u64,
            sched_period: deadline.period.as_nanos() as u64,
            ..Default::default()
        };
        return sched_setattr(&attr);
    }

    // pid 0 is the calling thread, not the whole process.
    let param = libc::sched_param {
        sched_priority: priority,
    };
    if unsafe { libc::sched_setscheduler(0, policy.os_id(), &param) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Policy and priority the calling thread is actually running with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observed {
    pub policy: Option<Policy>,
    pub priority: i32,
}

pub fn current_thread_sched() -> io::Result<Observed> {
    let raw = unsafe { libc::sched_getscheduler(0) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    let mut param = libc::sched_param { sched_priority: 0 };
    if unsafe { libc::sched_getparam(0, &mut param) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Observed {
        policy: Policy::from_os_id(raw),
        priority: param.sched_priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_table() -> PolicyTable {
        PolicyTable::from_ranges([
            (Policy::Other, PriorityRange { min: 0, max: 0 }),
            (Policy::Fifo, PriorityRange { min: 1, max: 99 }),
            (Policy::RoundRobin, PriorityRange { min: 1, max: 99 }),
            (Policy::Batch, PriorityRange { min: 0, max: 0 }),
            (Policy::Idle, PriorityRange { min: 0, max: 0 }),
            (Policy::Deadline, PriorityRange { min: 0, max: 0 }),
        ])
    }

    #[test]
    fn resolve_kernel_names() {
        assert_eq!(resolve("SCHED_OTHER").unwrap(), Policy::Other);
        assert_eq!(resolve("SCHED_NORMAL").unwrap(), Policy::Other);
        assert_eq!(resolve("SCHED_FIFO").unwrap(), Policy::Fifo);
        assert_eq!(resolve("SCHED_RR").unwrap(), Policy::RoundRobin);
        assert_eq!(resolve("SCHED_BATCH").unwrap(), Policy::Batch);
        assert_eq!(resolve("SCHED_IDLE").unwrap(), Policy::Idle);
        assert_eq!(resolve("SCHED_DEADLINE").unwrap(), Policy::Deadline);
        assert_eq!(resolve("SCHED_LOW_IDLE").unwrap(), Policy::LowIdle);
    }

    #[test]
    fn resolve_aliases() {
        assert_eq!(resolve("fifo").unwrap(), Policy::Fifo);
        assert_eq!(resolve("round-robin").unwrap(), Policy::RoundRobin);
        assert_eq!(resolve("rr").unwrap(), Policy::RoundRobin);
        assert_eq!(resolve("timesharing").unwrap(), Policy::Other);
        assert_eq!(resolve("low-idle").unwrap(), Policy::LowIdle);
        // Idle and LowIdle are distinct classes.
        assert_ne!(resolve("idle").unwrap(), resolve("low_idle").unwrap());
    }

    #[test]
    fn resolve_unknown() {
        match resolve("NOT_A_POLICY") {
            Err(ProfilerError::InvalidPolicy(name)) => assert_eq!(name, "NOT_A_POLICY"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(resolve("").is_err());
    }

    #[test]
    fn os_ids_round_trip() {
        for p in Policy::ALL {
            assert_eq!(Policy::from_os_id(p.os_id()), Some(p));
        }
        assert_eq!(
            Policy::from_os_id(libc::SCHED_FIFO | libc::SCHED_RESET_ON_FORK),
            Some(Policy::Fifo)
        );
        assert_eq!(Policy::from_os_id(42), None);
    }

    #[test]
    fn validate_against_table() {
        let table = linux_table();
        assert!(table.validate(Policy::Fifo, 1).is_ok());
        assert!(table.validate(Policy::Fifo, 99).is_ok());
        assert!(table.validate(Policy::Other, 0).is_ok());

        match table.validate(Policy::Fifo, 100) {
            Err(ProfilerError::PriorityOutOfRange { min, max, .. }) => {
                assert_eq!((min, max), (1, 99));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.validate(Policy::Fifo, 0).is_err());
        assert!(table.validate(Policy::Other, 1).is_err());
    }

    #[test]
    fn unsupported_policy() {
        let table = linux_table();
        assert!(matches!(
            table.validate(Policy::LowIdle, 0),
            Err(ProfilerError::UnsupportedPolicy(Policy::LowIdle, _))
        ));
        let unsupported: Vec<_> = table
            .entries()
            .filter(|(_, r)| r.is_none())
            .map(|(p, _)| p)
            .collect();
        assert_eq!(unsupported, vec![Policy::LowIdle]);
    }

    #[test]
    fn os_table_has_realtime_ranges() {
        let table = PolicyTable::query();
        let fifo = table.priority_range(Policy::Fifo).unwrap();
        assert!(fifo.min >= 1 && fifo.max > fifo.min);
        let other = table.priority_range(Policy::Other).unwrap();
        assert_eq!(other, PriorityRange { min: 0, max: 0 });
    }

    #[test]
    fn deadline_params() {
        assert!(DeadlineParams::default().validate().is_ok());
        let bad = DeadlineParams {
            runtime: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let tiny = DeadlineParams {
            runtime: Duration::from_nanos(10),
            ..Default::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn sched_attr_matches_kernel_size() {
        assert_eq!(std::mem::size_of::<SchedAttr>(), SCHED_ATTR_SIZE as usize);
    }

    #[test]
    fn current_thread_reads_back() {
        let observed = current_thread_sched().unwrap();
        assert!(observed.policy.is_some());
    }
}
