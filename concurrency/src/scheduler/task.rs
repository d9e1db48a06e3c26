//! A schedulable process body.
//!
//! A `Task` sits in at most one run queue at a time and is polled by at most
//! one worker at a time. Wakers only ever flip its scheduling state; whoever
//! wins the transition to `SCHEDULED` pushes it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::task::{waker_ref, ArcWake};

use crate::error::ProcessError;
use crate::function::ProcessFuture;
use crate::pid::{Pid, ProcessState};
use crate::registry::ProcessRecord;
use crate::runtime::Shared;
use crate::value::Value;

/// Not queued, not running: waiting on a waker.
const IDLE: u8 = 0;
/// In a run queue.
const SCHEDULED: u8 = 1;
/// Being polled by a worker.
const RUNNING: u8 = 2;
/// Woken while being polled; goes back to a queue when the poll ends.
const NOTIFIED: u8 = 3;
/// Body finished or was dropped.
const DONE: u8 = 4;

pub(crate) struct Task {
    record: Arc<ProcessRecord>,
    future: Mutex<Option<ProcessFuture>>,
    schedule: AtomicU8,
    shared: Weak<Shared>,
}

impl Task {
    /// New tasks start `SCHEDULED`: the spawner pushes them right away.
    pub(crate) fn new(
        record: Arc<ProcessRecord>,
        future: ProcessFuture,
        shared: Weak<Shared>,
    ) -> Arc<Self> {
        Arc::new(Task {
            record,
            future: Mutex::new(Some(future)),
            schedule: AtomicU8::new(SCHEDULED),
            shared,
        })
    }

    pub(crate) fn pid(&self) -> Pid {
        self.record.pid()
    }

    pub(crate) fn record(&self) -> &Arc<ProcessRecord> {
        &self.record
    }

    /// Make the task runnable again. Safe to call from any thread, any number
    /// of times.
    pub(crate) fn wake_task(self: &Arc<Self>) {
        let mut current = self.schedule.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self.schedule.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == SCHEDULED {
                        self.requeue();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Put a freshly `SCHEDULED` task back on a queue. The record reads
    /// `Runnable` from here until a worker picks it up.
    fn requeue(self: &Arc<Self>) {
        self.record.set_state(ProcessState::Runnable);
        if let Some(shared) = self.shared.upgrade() {
            tracing::trace!(pid = %self.pid(), "rescheduling process");
            shared.scheduler.push(self.clone());
        }
    }

    /// Claim the task for polling. Fails if it is not in a queue state.
    pub(crate) fn begin_run(&self) -> bool {
        self.schedule
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn poll(self: &Arc<Self>) -> Poll<Result<Value, ProcessError>> {
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(future) => future.as_mut().poll(&mut cx),
            None => Poll::Ready(Err(ProcessError::Killed)),
        }
    }

    /// End a poll that returned `Pending`. A wake that arrived meanwhile
    /// sends the task straight back to a queue; returns `true` in that case.
    pub(crate) fn end_run(self: &Arc<Self>) -> bool {
        if self
            .schedule
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return false;
        }
        if self
            .schedule
            .compare_exchange(NOTIFIED, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.requeue();
            return true;
        }
        false
    }

    /// Mark the task done and hand back its body so the caller can drop it
    /// outside the lock.
    pub(crate) fn complete(&self) -> Option<ProcessFuture> {
        self.schedule.store(DONE, Ordering::Release);
        self.future
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.schedule.load(Ordering::Acquire) == DONE
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn detached_task() -> Arc<Task> {
        let registry = Registry::new(None, None);
        let record = registry.allocate().unwrap();
        Task::new(record, Box::pin(async { Ok(Value::Nil) }), Weak::new())
    }

    fn state(task: &Task) -> u8 {
        task.schedule.load(Ordering::Acquire)
    }

    #[test]
    fn wake_while_idle_schedules() {
        let task = detached_task();
        assert!(task.begin_run());
        assert!(!task.end_run());
        assert_eq!(state(&task), IDLE);

        task.wake_task();
        assert_eq!(state(&task), SCHEDULED);
        task.wake_task();
        assert_eq!(state(&task), SCHEDULED);
    }

    #[test]
    fn wake_while_running_is_not_lost() {
        let task = detached_task();
        assert!(task.begin_run());
        task.wake_task();
        assert_eq!(state(&task), NOTIFIED);

        assert!(task.end_run());
        assert_eq!(state(&task), SCHEDULED);
        assert!(task.begin_run());
    }

    #[test]
    fn requeued_task_reads_runnable_not_blocked() {
        let task = detached_task();
        assert!(task.begin_run());
        task.record().set_state(ProcessState::Running);
        task.wake_task();

        task.record().set_state(ProcessState::Blocked);
        assert!(task.end_run());
        assert_eq!(task.record().state(), ProcessState::Runnable);

        assert!(task.begin_run());
        task.record().set_state(ProcessState::Blocked);
        assert!(!task.end_run());
        assert_eq!(task.record().state(), ProcessState::Blocked);

        task.wake_task();
        assert_eq!(task.record().state(), ProcessState::Runnable);
    }

    #[test]
    fn only_one_worker_can_claim() {
        let task = detached_task();
        assert!(task.begin_run());
        assert!(!task.begin_run());
    }

    #[test]
    fn completed_task_ignores_wakes() {
        let task = detached_task();
        assert!(task.begin_run());
        assert!(matches!(task.poll(), Poll::Ready(Ok(Value::Nil))));
        assert!(task.complete().is_some());
        assert!(task.is_done());

        task.wake_task();
        assert!(!task.begin_run());
        assert!(matches!(task.poll(), Poll::Ready(Err(ProcessError::Killed))));
    }
}
