//! Process registry: PID allocation and the table of process records.
//!
//! The table is split into shards, each behind its own lock, so lookups for
//! unrelated processes do not contend. The active-process counter is bumped
//! before a record becomes visible and dropped exactly once, on its first
//! terminal transition, so `count_active` never undercounts a live process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use strand_rt::CancellationToken;

use crate::error::RuntimeError;
use crate::mailbox::Mailbox;
use crate::pid::{ExitReason, Pid, ProcessState};
use crate::scheduler::task::Task;

const SHARDS: usize = 16;

/// Allocations between two retention sweeps.
const SWEEP_EVERY: u64 = 256;

/// Everything the runtime knows about one process.
pub(crate) struct ProcessRecord {
    pid: Pid,
    state: AtomicU8,
    mailbox: Mailbox,
    cancel: CancellationToken,
    exit: Mutex<Option<ExitReason>>,
    exited: Condvar,
    terminated_at: OnceLock<Instant>,
    task: Mutex<Weak<Task>>,
}

impl ProcessRecord {
    fn new(pid: Pid, state: ProcessState) -> Self {
        ProcessRecord {
            pid,
            state: AtomicU8::new(state as u8),
            mailbox: Mailbox::new(),
            cancel: CancellationToken::new(),
            exit: Mutex::new(None),
            exited: Condvar::new(),
            terminated_at: OnceLock::new(),
            task: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move to a non-terminal state. Refused once the process has terminated.
    pub(crate) fn set_state(&self, to: ProcessState) -> bool {
        debug_assert!(!to.is_terminal());
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if ProcessState::from_u8(raw).is_terminal() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }

    /// Record the exit. Only the first call has any effect; `on_first` runs
    /// before waiters are released.
    fn terminate(&self, reason: ExitReason, on_first: impl FnOnce()) -> bool {
        let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        let terminal = reason.terminal_state();
        let first = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if ProcessState::from_u8(raw).is_terminal() {
                    None
                } else {
                    Some(terminal as u8)
                }
            })
            .is_ok();
        if first {
            on_first();
            *exit = Some(reason);
            let _ = self.terminated_at.set(Instant::now());
            self.exited.notify_all();
        }
        first
    }

    pub(crate) fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Block the calling thread until the process terminates. A timeout too
    /// large to represent waits without a deadline.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<ExitReason> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(reason) = exit.as_ref() {
                return Some(reason.clone());
            }
            exit = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.exited
                        .wait_timeout(exit, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.exited.wait(exit).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.terminated_at
            .get()
            .is_some_and(|at| now.saturating_duration_since(*at) >= retention)
    }

    pub(crate) fn attach_task(&self, task: &Arc<Task>) {
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(task);
    }

    pub(crate) fn task(&self) -> Option<Arc<Task>> {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }
}

type Shard = RwLock<HashMap<Pid, Arc<ProcessRecord>>>;

pub(crate) struct Registry {
    shards: Vec<Shard>,
    main: Arc<ProcessRecord>,
    next_pid: AtomicU64,
    active: AtomicUsize,
    max_processes: Option<usize>,
    retention: Option<Duration>,
    closed: AtomicBool,
}

impl Registry {
    pub(crate) fn new(max_processes: Option<usize>, retention: Option<Duration>) -> Self {
        Registry {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            main: Arc::new(ProcessRecord::new(Pid::MAIN, ProcessState::Running)),
            next_pid: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            max_processes,
            retention,
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, pid: Pid) -> &Shard {
        &self.shards[(pid.id() % SHARDS as u64) as usize]
    }

    pub(crate) fn main(&self) -> &Arc<ProcessRecord> {
        &self.main
    }

    /// Issue the next PID and insert its record in `Runnable`.
    pub(crate) fn allocate(&self) -> Result<Arc<ProcessRecord>, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::ResourceExhausted(
                "runtime is shutting down".to_string(),
            ));
        }

        match self.max_processes {
            Some(max) => {
                self.active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .map_err(|_| {
                        RuntimeError::ResourceExhausted(format!("process limit of {max} reached"))
                    })?;
            }
            None => {
                self.active.fetch_add(1, Ordering::AcqRel);
            }
        }

        let id = match self
            .next_pid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
        {
            Ok(id) => id,
            Err(_) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(RuntimeError::ResourceExhausted(
                    "pid space exhausted".to_string(),
                ));
            }
        };

        let pid = Pid::from_raw(id);
        let record = Arc::new(ProcessRecord::new(pid, ProcessState::Runnable));
        self.shard(pid)
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, record.clone());

        if id % SWEEP_EVERY == 0 {
            self.sweep(Instant::now());
        }

        Ok(record)
    }

    /// Absence means the PID never existed or its record was reaped.
    pub(crate) fn lookup(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        if pid.is_main() {
            return Some(self.main.clone());
        }
        self.shard(pid)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
    }

    /// Move `record` to its terminal state. Idempotent; returns `true` for
    /// the call that actually terminated it.
    pub(crate) fn terminate(&self, record: &ProcessRecord, reason: ExitReason) -> bool {
        if record.pid().is_main() {
            return false;
        }
        record.terminate(reason, || {
            self.active.fetch_sub(1, Ordering::AcqRel);
        })
    }

    pub(crate) fn count_active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of records currently held, terminal ones included.
    pub(crate) fn retained(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    /// Remove a terminal record, returning how it exited.
    pub(crate) fn reap(&self, pid: Pid) -> Option<ExitReason> {
        let mut shard = self.shard(pid).write().unwrap_or_else(|e| e.into_inner());
        let reason = shard.get(&pid).filter(|r| !r.is_alive())?.exit_reason();
        shard.remove(&pid);
        reason
    }

    /// Evict terminal records older than the retention period.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, record| !record.expired(now, retention));
            evicted += before - shard.len();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "swept terminated processes");
        }
        evicted
    }

    /// Refuse further allocations.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Remove every record, live or not.
    pub(crate) fn drain(&self) -> Vec<Arc<ProcessRecord>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .drain()
                    .map(|(_, record)| record)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub(crate) fn live(&self) -> Vec<Arc<ProcessRecord>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .values()
                    .filter(|record| record.is_alive())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::collections::HashSet;
    use std::thread;

    impl Registry {
        fn mark_finished(&self, pid: Pid, result: Result<Value, String>) -> bool {
            let reason = match result {
                Ok(value) => ExitReason::Normal(value),
                Err(message) => ExitReason::Error(message),
            };
            self.lookup(pid)
                .is_some_and(|record| self.terminate(&record, reason))
        }

        fn mark_killed(&self, pid: Pid) -> bool {
            self.lookup(pid)
                .is_some_and(|record| self.terminate(&record, ExitReason::Kill))
        }
    }

    #[test]
    fn allocate_issues_unique_increasing_pids() {
        let registry = Arc::new(Registry::new(None, None));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                (0..250)
                    .map(|_| registry.allocate().unwrap().pid())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let pids = handle.join().unwrap();
            assert!(pids.windows(2).all(|w| w[0] < w[1]));
            for pid in pids {
                assert!(!pid.is_main());
                assert!(seen.insert(pid));
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(registry.count_active(), 1000);
    }

    #[test]
    fn new_records_start_runnable() {
        let registry = Registry::new(None, None);
        let record = registry.allocate().unwrap();
        assert_eq!(record.state(), ProcessState::Runnable);
        assert_eq!(record.pid(), Pid::from(1));
        assert!(registry.lookup(record.pid()).is_some());
    }

    #[test]
    fn lookup_of_main_and_unknown() {
        let registry = Registry::new(None, None);
        assert_eq!(registry.lookup(Pid::MAIN).map(|r| r.pid()), Some(Pid::MAIN));
        assert!(registry.lookup(Pid::from(999)).is_none());
    }

    #[test]
    fn terminal_transitions_are_idempotent() {
        let registry = Registry::new(None, None);
        let pid = registry.allocate().unwrap().pid();
        assert_eq!(registry.count_active(), 1);

        assert!(registry.mark_finished(pid, Ok(Value::from(42))));
        assert!(!registry.mark_killed(pid));
        assert!(!registry.mark_finished(pid, Err("late".to_string())));
        assert_eq!(registry.count_active(), 0);

        let record = registry.lookup(pid).unwrap();
        assert_eq!(record.state(), ProcessState::Finished);
        assert_eq!(record.exit_reason(), Some(ExitReason::Normal(Value::from(42))));
        assert!(!record.set_state(ProcessState::Running));
    }

    #[test]
    fn main_record_cannot_terminate() {
        let registry = Registry::new(None, None);
        assert!(!registry.mark_killed(Pid::MAIN));
        assert!(registry.main().is_alive());
    }

    #[test]
    fn running_blocked_cycle_is_allowed() {
        let registry = Registry::new(None, None);
        let record = registry.allocate().unwrap();
        assert!(record.set_state(ProcessState::Running));
        assert!(record.set_state(ProcessState::Blocked));
        assert!(record.set_state(ProcessState::Running));
        assert_eq!(record.state(), ProcessState::Running);
    }

    #[test]
    fn process_limit_reports_resource_exhausted() {
        let registry = Registry::new(Some(2), None);
        let first = registry.allocate().unwrap();
        registry.allocate().unwrap();
        assert!(matches!(
            registry.allocate(),
            Err(RuntimeError::ResourceExhausted(_))
        ));

        registry.mark_killed(first.pid());
        assert!(registry.allocate().is_ok());
    }

    #[test]
    fn closed_registry_refuses_allocation() {
        let registry = Registry::new(None, None);
        registry.close();
        assert!(matches!(
            registry.allocate(),
            Err(RuntimeError::ResourceExhausted(_))
        ));
        assert_eq!(registry.count_active(), 0);
    }

    #[test]
    fn reap_removes_only_terminal_records() {
        let registry = Registry::new(None, None);
        let live = registry.allocate().unwrap().pid();
        let done = registry.allocate().unwrap().pid();
        registry.mark_killed(done);

        assert_eq!(registry.reap(live), None);
        assert_eq!(registry.reap(done), Some(ExitReason::Kill));
        assert!(registry.lookup(done).is_none());
        assert!(registry.lookup(live).is_some());
    }

    #[test]
    fn sweep_evicts_after_retention() {
        let registry = Registry::new(None, Some(Duration::from_millis(10)));
        let pid = registry.allocate().unwrap().pid();
        registry.mark_finished(pid, Ok(Value::Nil));

        assert_eq!(registry.sweep(Instant::now()), 0);
        assert_eq!(
            registry.sweep(Instant::now() + Duration::from_millis(20)),
            1
        );
        assert!(registry.lookup(pid).is_none());
    }

    #[test]
    fn sweep_without_retention_keeps_everything() {
        let registry = Registry::new(None, None);
        let pid = registry.allocate().unwrap().pid();
        registry.mark_killed(pid);
        assert_eq!(registry.sweep(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(registry.retained(), 1);
    }

    #[test]
    fn wait_returns_exit_from_other_thread() {
        let registry = Arc::new(Registry::new(None, None));
        let record = registry.allocate().unwrap();
        let pid = record.pid();

        let finisher = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            finisher.mark_finished(pid, Err("boom".to_string()));
        });

        assert_eq!(
            record.wait(Some(Duration::from_secs(5))),
            Some(ExitReason::Error("boom".to_string()))
        );
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_live_process() {
        let registry = Registry::new(None, None);
        let record = registry.allocate().unwrap();
        assert_eq!(record.wait(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn wait_with_huge_timeout_does_not_overflow() {
        let registry = Arc::new(Registry::new(None, None));
        let record = registry.allocate().unwrap();
        let pid = record.pid();

        let finisher = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            finisher.mark_killed(pid);
        });

        assert_eq!(record.wait(Some(Duration::MAX)), Some(ExitReason::Kill));
        handle.join().unwrap();
    }
}
