//! Coordination between a command that is executing and the connection
//! waiting for it.
//!
//! A command's work claims the gate right before it mutates anything; the
//! connection claims it when it gives up waiting. Exactly one side wins, so a
//! client that was told `ER timeout` can rely on the command having changed
//! nothing.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

#[derive(Debug, Clone, Default)]
pub struct CommitGate {
    state: Arc<AtomicU8>,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the gate for the executing work. `false` means the waiter
    /// already walked away and the work must not touch state.
    pub fn begin_commit(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == COMMITTING,
        }
    }

    /// Claims the gate for the waiter. `false` means the work is already
    /// committing and its result should be awaited instead.
    pub fn abandon(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == ABANDONED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_first_blocks_abandon() {
        let gate = CommitGate::new();
        assert!(gate.begin_commit());
        assert!(!gate.abandon());
        assert!(gate.begin_commit());
    }

    #[test]
    fn abandon_first_blocks_commit() {
        let gate = CommitGate::new();
        let worker = gate.clone();
        assert!(gate.abandon());
        assert!(!worker.begin_commit());
        assert!(gate.abandon());
    }
}
