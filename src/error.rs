// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::policy::Policy;

pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Everything that can stop a profiling run.
///
/// None of these are recoverable mid-race. Usage and config errors are
/// raised before any memory is allocated or any worker exists; resource
/// errors abort the run and no report is produced.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("invalid policy {0:?}")]
    InvalidPolicy(String),

    #[error("invalid priority value {priority} for {policy}: (min: {min}) (max: {max})")]
    PriorityOutOfRange {
        policy: Policy,
        priority: i32,
        min: i32,
        max: i32,
    },

    #[error("{0} is not supported by the running kernel")]
    UnsupportedPolicy(Policy, #[source] io::Error),

    #[error("failed to allocate a {0} byte buffer")]
    Alloc(usize),

    #[error("failed to spawn worker {0}")]
    Spawn(char, #[source] io::Error),

    #[error("arena lock failure")]
    Lock(#[source] io::Error),

    #[error("worker {worker}: failed to set policy {policy}")]
    PolicyApply {
        worker: char,
        policy: Policy,
        #[source]
        source: io::Error,
    },

    #[error("worker {0}: failed to set CPU affinity")]
    Affinity(char, #[source] nix::Error),

    #[error("race did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("race finished with {claimed} of {capacity} slots claimed")]
    Incomplete { claimed: usize, capacity: usize },

    #[error("run aborted before the start gate released")]
    Aborted,
}

impl ProfilerError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Configuration errors: the requested policy setup cannot be honored.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidPolicy(_) | Self::PriorityOutOfRange { .. } | Self::UnsupportedPolicy(..)
        )
    }

    /// Errors caused by the OS refusing a resource during the run.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Self::Alloc(_)
                | Self::Spawn(..)
                | Self::Lock(_)
                | Self::PolicyApply { .. }
                | Self::Affinity(..)
        )
    }
}
