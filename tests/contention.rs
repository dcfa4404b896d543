// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// End-to-end races through the library API. Every worker here runs
// SCHED_OTHER or SCHED_BATCH, which any unprivileged user may select, so
// these run without root. SCHED_FIFO at priority 0 is refused by every
// kernel, root or not, which makes it a reliable policy failure.

use std::time::Duration;

use thread_profiler::stats;
use thread_profiler::ApplyMode;
use thread_profiler::Policy;
use thread_profiler::PolicyTable;
use thread_profiler::ProfilerError;
use thread_profiler::RunConfig;
use thread_profiler::Session;

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn run(thread_count: i64, buffer_size_kb: i64, pairs: &[&str]) -> stats::Report {
    let table = PolicyTable::query();
    let config = RunConfig::from_args(thread_count, buffer_size_kb, &strings(pairs), &table)
        .expect("valid config");
    Session::new(config).unwrap().run().unwrap()
}

fn assert_invariants(report: &stats::Report) {
    let writes: usize = report.threads.iter().map(|t| t.writes).sum();
    let switches: usize = report.threads.iter().map(|t| t.switches).sum();
    assert_eq!(writes, report.capacity);
    assert_eq!(switches, report.runs);
    assert_eq!(report.compacted.chars().count(), report.runs);

    let pct: f64 = report.threads.iter().map(|t| t.usage_pct).sum();
    assert!((pct - 100.0).abs() < 1e-6, "percentages sum to {}", pct);
    for t in report.threads.iter() {
        let expected = t.writes as f64 / report.capacity as f64 * 100.0;
        assert!((t.usage_pct - expected).abs() < 1e-9);
        assert!(t.longest_run <= t.writes);
    }

    // No two neighbouring runs share an owner.
    let runs: Vec<char> = report.compacted.chars().collect();
    assert!(runs.windows(2).all(|w| w[0] != w[1]));
}

#[test]
fn single_worker() {
    for kb in [1, 3, 16] {
        let report = run(1, kb, &[]);
        assert_eq!(report.capacity, kb as usize * 1024);
        assert_eq!(report.compacted, "A");
        let t = &report.threads[0];
        assert_eq!(t.switches, 1);
        assert_eq!(t.writes, report.capacity);
        assert_eq!(t.usage_pct, 100.0);
        assert_invariants(&report);
    }
}

#[test]
fn default_capacity_below_one_kb() {
    for kb in [0, -4] {
        let report = run(1, kb, &[]);
        assert_eq!(report.capacity, 1024);
    }
}

#[test]
fn two_default_workers() {
    let report = run(2, 1, &[]);
    assert_eq!(report.capacity, 1024);
    for t in report.threads.iter() {
        assert_eq!(t.requested_policy, Policy::Other);
        assert_eq!(t.requested_priority, 0);
        assert_eq!(t.actual_policy, Some(Policy::Other));
    }
    let writes: usize = report.threads.iter().map(|t| t.writes).sum();
    assert_eq!(writes, 1024);
    assert!(report.threads.iter().map(|t| t.switches).sum::<usize>() >= 1);
    assert_invariants(&report);
}

#[test]
fn many_workers_mixed_policies() {
    let report = run(
        8,
        64,
        &["SCHED_BATCH", "0", "SCHED_OTHER", "0", "batch", "0"],
    );
    assert_eq!(report.threads.len(), 8);
    assert_eq!(report.threads[0].actual_policy, Some(Policy::Batch));
    assert_eq!(report.threads[2].requested_policy, Policy::Batch);
    assert_eq!(report.threads[7].requested_policy, Policy::Other);
    let symbols: String = report.threads.iter().map(|t| t.id.symbol()).collect();
    assert_eq!(symbols, "ABCDEFGH");
    assert_invariants(&report);
}

#[test]
fn summarize_twice_is_identical() {
    let table = PolicyTable::query();
    let config = RunConfig::from_args(3, 4, &[], &table).unwrap();
    let report = Session::new(config).unwrap().run().unwrap();

    let mut first = Vec::new();
    let mut second = Vec::new();
    report.format(&mut first).unwrap();
    report.format(&mut second).unwrap();
    assert_eq!(first, second);
}

#[test]
fn invalid_priority_rejected_before_allocation() {
    let table = PolicyTable::query();
    let max = table.priority_range(Policy::Fifo).unwrap().max;
    let err = RunConfig::from_args(2, 1, &strings(&["SCHED_FIFO", &(max + 1).to_string()]), &table)
        .unwrap_err();
    assert!(matches!(err, ProfilerError::PriorityOutOfRange { .. }));
}

#[test]
fn unknown_policy_rejected() {
    let table = PolicyTable::query();
    let err = RunConfig::from_args(2, 1, &strings(&["NOT_A_POLICY", "0"]), &table).unwrap_err();
    assert!(err.is_config());
}

#[test]
fn best_effort_reports_actual_policy() {
    // SCHED_OTHER cannot fail, so best effort behaves like strict here and
    // the actual policy must still be read back.
    let table = PolicyTable::query();
    let mut config = RunConfig::from_args(2, 1, &[], &table).unwrap();
    config.apply_mode = ApplyMode::BestEffort;
    let report = Session::new(config).unwrap().run().unwrap();
    assert!(report
        .threads
        .iter()
        .all(|t| t.actual_policy == Some(Policy::Other) && t.actual_priority == Some(0)));
}

fn with_refused_policy(apply_mode: ApplyMode) -> RunConfig {
    let table = PolicyTable::query();
    let mut config = RunConfig::from_args(3, 1, &[], &table).unwrap();
    config.threads[2].policy = Policy::Fifo;
    config.threads[2].priority = 0;
    config.apply_mode = apply_mode;
    config
}

#[test]
fn strict_policy_failure_aborts_everyone() {
    // Returning at all means workers A and B were released from the gate.
    let err = Session::new(with_refused_policy(ApplyMode::Strict))
        .unwrap()
        .run()
        .unwrap_err();
    assert!(
        matches!(
            err,
            ProfilerError::PolicyApply {
                worker: 'C',
                policy: Policy::Fifo,
                ..
            }
        ),
        "{:?}",
        err
    );
    assert!(err.is_resource());
}

#[test]
fn best_effort_races_with_fallback_policy() {
    let report = Session::new(with_refused_policy(ApplyMode::BestEffort))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.capacity, 1024);
    let c = &report.threads[2];
    assert_eq!(c.requested_policy, Policy::Fifo);
    assert_eq!(c.actual_policy, Some(Policy::Other));
    assert_invariants(&report);
}

#[test]
fn timeout_abandons_long_race() {
    let table = PolicyTable::query();
    // 64Mi slots is far more than four workers claim in 5ms.
    let mut config = RunConfig::from_args(4, 64 * 1024, &[], &table).unwrap();
    config.timeout = Some(Duration::from_millis(5));
    let err = Session::new(config).unwrap().run().unwrap_err();
    assert!(
        matches!(err, ProfilerError::TimedOut(t) if t == Duration::from_millis(5)),
        "{:?}",
        err
    );
}
