// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::CommandFactory;
use clap::Parser;
use clap::ValueEnum;
use log::debug;
use log::warn;

use thread_profiler::policy::DeadlineParams;
use thread_profiler::ApplyMode;
use thread_profiler::LockProtocol;
use thread_profiler::PolicyTable;
use thread_profiler::ProfilerError;
use thread_profiler::RunConfig;
use thread_profiler::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

/// thread_profiler: scheduling-contention profiler
///
/// Spawns <THREAD_COUNT> workers that race to fill a buffer of
/// <BUFFER_SIZE_KB> KiB, one byte per claim, under a single lock. Each
/// worker can be given its own scheduling policy and priority with
/// trailing <POLICY> <PRIORITY> pairs (e.g. SCHED_FIFO 10 SCHED_RR 5);
/// workers without a pair run SCHED_OTHER at priority 0. Options must come
/// before the positional arguments.
///
/// The report lists the buffer compacted to one symbol per run of the same
/// owner, then per-thread switch counts, write counts and share of the
/// buffer. Switches are ownership changes seen in the buffer, a lower bound
/// on real context switches.
#[derive(Debug, Parser)]
#[clap(name = "thread_profiler", version)]
struct Opts {
    /// Number of worker threads (1-62).
    #[clap(required_unless_present = "list_policies", allow_negative_numbers = true)]
    thread_count: Option<i64>,

    /// Buffer size in KiB. Values below 1 select the 1KiB default.
    #[clap(required_unless_present = "list_policies", allow_negative_numbers = true)]
    buffer_size_kb: Option<i64>,

    /// <POLICY> <PRIORITY> pairs for workers 1..k.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    policies: Vec<String>,

    /// Enable verbose output, including per-worker policy details. Specify
    /// multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Report format.
    #[clap(long, value_enum, default_value = "text")]
    format: ReportFormat,

    /// Keep going when a worker's policy cannot be applied. The worker then
    /// races with whatever policy it has, and the report shows requested
    /// vs actual.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    best_effort: bool,

    /// Pin every worker to this CPU. Without pinning, workers on different
    /// CPUs do not compete for the same runqueue.
    #[clap(long)]
    pin_cpu: Option<usize>,

    /// Use a plain mutex for the buffer instead of a priority-inheriting
    /// one.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_prio_inherit: bool,

    /// Abort the run if the buffer is not filled within this many seconds.
    /// No report is printed for an aborted run.
    #[clap(long)]
    timeout_s: Option<f64>,

    /// SCHED_DEADLINE runtime in microseconds.
    #[clap(long, default_value = "5000")]
    dl_runtime_us: u64,

    /// SCHED_DEADLINE relative deadline in microseconds.
    #[clap(long, default_value = "10000")]
    dl_deadline_us: u64,

    /// SCHED_DEADLINE period in microseconds.
    #[clap(long, default_value = "10000")]
    dl_period_us: u64,

    /// List the supported policies with their priority ranges and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    list_policies: bool,
}

fn build_config(opts: &Opts, table: &PolicyTable) -> Result<RunConfig> {
    let (Some(thread_count), Some(buffer_size_kb)) = (opts.thread_count, opts.buffer_size_kb)
    else {
        bail!("<THREAD_COUNT> and <BUFFER_SIZE_KB> are required");
    };

    let timeout = match opts.timeout_s {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| ProfilerError::usage(format!("invalid timeout {}", secs)))?,
        ),
        None => None,
    };

    let config = RunConfig {
        apply_mode: if opts.best_effort {
            ApplyMode::BestEffort
        } else {
            ApplyMode::Strict
        },
        deadline: DeadlineParams {
            runtime: Duration::from_micros(opts.dl_runtime_us),
            deadline: Duration::from_micros(opts.dl_deadline_us),
            period: Duration::from_micros(opts.dl_period_us),
        },
        pin_cpu: opts.pin_cpu,
        timeout,
        lock_protocol: if opts.no_prio_inherit {
            LockProtocol::None
        } else {
            LockProtocol::Inherit
        },
        ..RunConfig::from_args(thread_count, buffer_size_kb, &opts.policies, table)?
    };
    config.validate()?;
    Ok(config)
}

fn list_policies<W: Write>(table: &PolicyTable, w: &mut W) -> Result<()> {
    for (policy, range) in table.entries() {
        match range {
            Some(r) => writeln!(w, "{:<16} id={} priority={}", policy, policy.os_id(), r)?,
            None => writeln!(w, "{:<16} id={} unsupported", policy, policy.os_id())?,
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let table = PolicyTable::query();
    if opts.list_policies {
        return list_policies(&table, &mut std::io::stdout());
    }

    let config = match build_config(&opts, &table) {
        Ok(config) => config,
        Err(e) => {
            match e.downcast_ref::<ProfilerError>() {
                Some(ProfilerError::Usage(_)) => {
                    eprintln!("{}", Opts::command().render_usage());
                }
                Some(pe) if pe.is_config() => {
                    warn!("See --list-policies for the policies and priority ranges this kernel supports");
                }
                _ => {}
            }
            return Err(e);
        }
    };
    debug!("Opts: {:?}", opts);

    let report = match Session::new(config).and_then(Session::run) {
        Ok(report) => report,
        Err(e) => {
            if e.is_resource() {
                warn!("The OS refused a resource; real-time policies need root or CAP_SYS_NICE");
            }
            return Err(e).context("profiling run failed");
        }
    };

    let mut out = std::io::stdout().lock();
    match opts.format {
        ReportFormat::Text => report.format(&mut out),
        ReportFormat::Json => report.format_json(&mut out),
    }
}
