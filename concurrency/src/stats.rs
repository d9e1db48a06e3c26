//! Runtime-wide counters for introspection.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct Stats {
    spawned: AtomicU64,
    finished: AtomicU64,
    errored: AtomicU64,
    killed: AtomicU64,
    messages: AtomicU64,
    steals: AtomicU64,
}

impl Stats {
    pub(crate) fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finish(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_kill(&self) {
        self.killed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        active: usize,
        retained: usize,
        workers: usize,
        pending_timers: usize,
    ) -> RuntimeStats {
        RuntimeStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            messages_sent: self.messages.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            active,
            retained,
            workers,
            pending_timers,
        }
    }
}

/// A point-in-time view of the runtime's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Processes successfully spawned.
    pub spawned: u64,
    /// Processes whose body returned a value.
    pub finished: u64,
    /// Processes that ended with an unhandled error or panic.
    pub errored: u64,
    /// Processes terminated by `kill` or shutdown.
    pub killed: u64,
    /// Messages accepted into a mailbox.
    pub messages_sent: u64,
    /// Tasks a worker took from a peer's deque.
    pub steals: u64,
    /// Processes currently runnable, running or blocked.
    pub active: usize,
    /// Process records still held by the registry.
    pub retained: usize,
    /// Worker threads in the pool.
    pub workers: usize,
    /// Sleeps and receive timeouts still waiting on the timer thread.
    pub pending_timers: usize,
}

impl RuntimeStats {
    /// Processes that have reached a terminal state.
    pub fn terminated(&self) -> u64 {
        self.finished + self.errored + self.killed
    }
}
