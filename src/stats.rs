// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Post-run aggregation of the ownership trace.
//!
//! Switch counts only see ownership changes that made it into the buffer.
//! A worker preempted and rescheduled between two of its own claims leaves
//! no mark, so the numbers are a lower bound on real context switches.

use std::io::Write;

use anyhow::Result;
use log::warn;
use serde::Serialize;

use crate::arena::Trace;
use crate::arena::WorkerId;
use crate::policy::Policy;
use crate::worker::ThreadStats;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThreadReport {
    pub id: WorkerId,
    pub requested_policy: Policy,
    pub requested_priority: i32,
    pub actual_policy: Option<Policy>,
    pub actual_priority: Option<i32>,
    pub switches: usize,
    pub writes: usize,
    pub longest_run: usize,
    pub usage_pct: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub capacity: usize,
    /// One symbol per maximal run of equal owners, in buffer order.
    pub compacted: String,
    pub runs: usize,
    pub threads: Vec<ThreadReport>,
}

/// Run-length encode the trace down to one symbol per run.
pub fn compact(trace: &Trace) -> String {
    let mut out = String::new();
    let mut last = None;
    for owner in trace.owners() {
        if last != Some(owner) {
            out.push(owner.symbol());
            last = Some(owner);
        }
    }
    out
}

pub fn summarize(trace: &Trace, stats: &[ThreadStats]) -> Report {
    let capacity = trace.len();
    let compacted = compact(trace);
    let runs = compacted.chars().count();

    let threads: Vec<ThreadReport> = stats
        .iter()
        .map(|s| ThreadReport {
            id: s.id,
            requested_policy: s.requested_policy,
            requested_priority: s.requested_priority,
            actual_policy: s.actual_policy,
            actual_priority: s.actual_priority,
            switches: s.switches,
            writes: s.writes,
            longest_run: s.longest_run,
            usage_pct: if trace.is_empty() {
                0.0
            } else {
                s.writes as f64 / capacity as f64 * 100.0
            },
        })
        .collect();

    let total_writes: usize = threads.iter().map(|t| t.writes).sum();
    let total_switches: usize = threads.iter().map(|t| t.switches).sum();
    if total_writes != capacity || total_switches != runs {
        warn!(
            "Counters disagree with the trace: writes={}/{} switches={}/{}",
            total_writes, capacity, total_switches, runs
        );
    }

    Report {
        capacity,
        compacted,
        runs,
        threads,
    }
}

impl Report {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "Compacting the buffer:")?;
        writeln!(w, "{}", self.compacted)?;

        writeln!(w, "Thread scheduling counts:")?;
        for t in self.threads.iter() {
            writeln!(w, "{}: {}", t.id, t.switches)?;
        }

        writeln!(w, "Thread write counts:")?;
        for t in self.threads.iter() {
            writeln!(w, "{}: {}", t.id, t.writes)?;
        }

        writeln!(w, "Thread usage percentage:")?;
        for t in self.threads.iter() {
            writeln!(w, "{}: {:.2}%", t.id, t.usage_pct)?;
        }
        Ok(())
    }

    pub fn format_json<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "{}", serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
