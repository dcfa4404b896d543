// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The contended buffer.
//!
//! Every claim happens inside one short critical section: read the cursor,
//! compare with the capacity, write the claimant, bump the cursor, swap
//! the last writer. Nothing else runs under the lock so that the trace
//! reflects which thread the scheduler ran next rather than lock-hold
//! latency.

use std::fmt;

use serde::Serialize;

use crate::error::ProfilerError;
use crate::error::Result;
use crate::sync::LockProtocol;
use crate::sync::PiMutex;

/// Bytes per `buffer_size_kb` unit, also the capacity used when no size is
/// given.
pub const DEFAULT_CAPACITY: usize = 1024;

const SYMBOLS: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Maximum number of workers in one run, one printable symbol each.
pub const MAX_WORKERS: usize = SYMBOLS.len();

const UNCLAIMED: u8 = u8::MAX;

/// Worker identity, assigned in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u8);

impl WorkerId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_WORKERS).then(|| Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn symbol(self) -> char {
        SYMBOLS[self.index()] as char
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl Serialize for WorkerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_char(self.symbol())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Claimed {
        position: usize,
        previous: Option<WorkerId>,
    },
    Exhausted,
}

struct Slots {
    owners: Box<[u8]>,
    cursor: usize,
    last_writer: Option<WorkerId>,
}

pub struct ContentionArena {
    slots: PiMutex<Slots>,
    capacity: usize,
}

impl ContentionArena {
    pub fn new(capacity: usize, protocol: LockProtocol) -> Result<Self> {
        if capacity == 0 {
            return Err(ProfilerError::usage("arena capacity must be at least 1"));
        }

        let mut owners = Vec::new();
        owners
            .try_reserve_exact(capacity)
            .map_err(|_| ProfilerError::Alloc(capacity))?;
        owners.resize(capacity, UNCLAIMED);

        let slots = Slots {
            owners: owners.into_boxed_slice(),
            cursor: 0,
            last_writer: None,
        };
        Ok(Self {
            slots: PiMutex::new(slots, protocol).map_err(ProfilerError::Lock)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn claim_slot(&self, id: WorkerId) -> Result<Claim> {
        let mut slots = self.slots.lock().map_err(ProfilerError::Lock)?;
        let position = slots.cursor;
        if position >= self.capacity {
            return Ok(Claim::Exhausted);
        }
        slots.owners[position] = id.0;
        slots.cursor = position + 1;
        let previous = slots.last_writer.replace(id);
        Ok(Claim::Claimed { position, previous })
    }

    /// Consume the arena once every worker is gone.
    pub fn finish(self) -> Result<Trace> {
        let slots = self.slots.into_inner();
        if slots.cursor != self.capacity {
            return Err(ProfilerError::Incomplete {
                claimed: slots.cursor,
                capacity: self.capacity,
            });
        }
        Ok(Trace {
            owners: slots.owners,
        })
    }
}

/// The fully claimed buffer, read-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    owners: Box<[u8]>,
}

impl Trace {
    /// Build a trace from owner symbols, e.g. `"AABBA"`.
    #[cfg(test)]
    pub(crate) fn from_symbols(symbols: &str) -> Option<Self> {
        let owners = symbols
            .bytes()
            .map(|b| SYMBOLS.iter().position(|&s| s == b).map(|i| i as u8))
            .collect::<Option<Vec<u8>>>()?;
        if owners.is_empty() {
            return None;
        }
        Some(Self {
            owners: owners.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owners(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.owners.iter().map(|&b| WorkerId(b))
    }
}
