// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Condvar;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Released,
    Aborted,
}

#[derive(Debug)]
enum GateState {
    Waiting(usize),
    Released,
    Aborted,
}

/// One-shot start barrier.
///
/// Like `std::sync::Barrier` sized to the worker count, except that it can
/// be aborted: a worker that fails to configure itself, or a spawn failure
/// in the session, must not leave the others waiting for arrivals that
/// will never come.
#[derive(Debug)]
pub struct StartGate {
    parties: usize,
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl StartGate {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(GateState::Waiting(0)),
            cvar: Condvar::new(),
        }
    }

    /// Block until all parties have arrived or the gate is aborted.
    pub fn arrive(&self) -> GateOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let GateState::Waiting(arrived) = *state {
            let arrived = arrived + 1;
            if arrived >= self.parties {
                *state = GateState::Released;
                self.cvar.notify_all();
            } else {
                *state = GateState::Waiting(arrived);
            }
        }

        loop {
            match *state {
                GateState::Waiting(_) => {}
                GateState::Released => return GateOutcome::Released,
                GateState::Aborted => return GateOutcome::Aborted,
            }
            state = self.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Release every current and future arrival with `Aborted`. No effect
    /// once the gate has been released.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let GateState::Waiting(_) = *state {
            *state = GateState::Aborted;
            self.cvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_passes_through() {
        let gate = StartGate::new(1);
        assert_eq!(gate.arrive(), GateOutcome::Released);
        // Single use: later arrivals see the released state.
        assert_eq!(gate.arrive(), GateOutcome::Released);
    }

    #[test]
    fn nobody_passes_before_last_arrival() {
        let gate = StartGate::new(4);
        let passed = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    assert_eq!(gate.arrive(), GateOutcome::Released);
                    passed.fetch_add(1, Ordering::SeqCst);
                });
            }
            thread::sleep(Duration::from_millis(50));
            assert_eq!(passed.load(Ordering::SeqCst), 0);
            assert_eq!(gate.arrive(), GateOutcome::Released);
        });
        assert_eq!(passed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn abort_wakes_waiters() {
        let gate = StartGate::new(3);
        thread::scope(|s| {
            let h = s.spawn(|| gate.arrive());
            thread::sleep(Duration::from_millis(20));
            gate.abort();
            assert_eq!(h.join().unwrap(), GateOutcome::Aborted);
        });
        assert_eq!(gate.arrive(), GateOutcome::Aborted);
    }

    #[test]
    fn abort_after_release_is_ignored() {
        let gate = StartGate::new(1);
        assert_eq!(gate.arrive(), GateOutcome::Released);
        gate.abort();
        assert_eq!(gate.arrive(), GateOutcome::Released);
    }
}
