use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;

use rand::Rng;
use strand_rt::deque::{Steal, Worker as LocalQueue};

use super::task::Task;
use crate::context::CurrentPid;
use crate::error::ProcessError;
use crate::pid::{ExitReason, ProcessState};
use crate::runtime::Shared;

/// Every this many tasks a worker looks at the injector before its own
/// deque, so work scheduled from outside the pool is not starved.
const INJECTOR_INTERVAL: u32 = 61;

/// Every this many tasks a worker takes from the FIFO end of its own deque,
/// so a LIFO ping-pong cannot starve older local tasks.
const FIFO_INTERVAL: u32 = 31;

// ---------------------------------------------------------------------------
// Thread-local run queue
// ---------------------------------------------------------------------------

struct Local {
    scheduler_id: u64,
    queue: LocalQueue<Arc<Task>>,
}

thread_local! {
    static LOCAL: RefCell<Option<Local>> = const { RefCell::new(None) };
}

/// Push onto the calling thread's deque if it is a worker of `scheduler_id`.
/// Hands the task back otherwise.
pub(crate) fn push_local(scheduler_id: u64, task: Arc<Task>) -> Result<(), Arc<Task>> {
    let mut task = Some(task);
    let _ = LOCAL.try_with(|local| {
        if let Some(local) = local.borrow().as_ref() {
            if local.scheduler_id == scheduler_id {
                if let Some(task) = task.take() {
                    local.queue.push(task);
                }
            }
        }
    });
    match task {
        Some(task) => Err(task),
        None => Ok(()),
    }
}

fn pop_local() -> Option<Arc<Task>> {
    LOCAL
        .try_with(|local| local.borrow().as_ref().and_then(|local| local.queue.pop()))
        .ok()
        .flatten()
}

fn steal_into_local(
    source: impl Fn(&LocalQueue<Arc<Task>>) -> Steal<Arc<Task>>,
) -> Option<Arc<Task>> {
    LOCAL
        .try_with(|local| {
            let local = local.borrow();
            let local = local.as_ref()?;
            loop {
                match source(&local.queue) {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => return None,
                    Steal::Retry => continue,
                }
            }
        })
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) struct Worker {
    index: usize,
    shared: Arc<Shared>,
    ticks: u32,
}

impl Worker {
    pub(crate) fn new(index: usize, shared: Arc<Shared>) -> Self {
        Worker {
            index,
            shared,
            ticks: 0,
        }
    }

    /// Worker thread body. Returns once the scheduler shuts down; tasks left
    /// in the local deque are dropped with it.
    pub(crate) fn run(mut self, queue: LocalQueue<Arc<Task>>) {
        let scheduler_id = self.shared.scheduler.id();
        LOCAL.with(|local| {
            *local.borrow_mut() = Some(Local {
                scheduler_id,
                queue,
            })
        });
        tracing::trace!(worker = self.index, "worker started");

        while !self.shared.scheduler.is_shutdown() {
            match self.find_task() {
                Some(task) => self.run_task(task),
                None => self.shared.scheduler.park(),
            }
        }

        let local = LOCAL.with(|local| local.borrow_mut().take());
        drop(local);
        tracing::trace!(worker = self.index, "worker stopped");
    }

    /// Local deque, then a random peer, then the injector.
    fn find_task(&mut self) -> Option<Arc<Task>> {
        self.ticks = self.ticks.wrapping_add(1);
        let scheduler = &self.shared.scheduler;

        if self.ticks % INJECTOR_INTERVAL == 0 {
            if let Some(task) = steal_into_local(|local| scheduler.injector().steal_batch_and_pop(local)) {
                return Some(task);
            }
        }

        if self.ticks % FIFO_INTERVAL == 0 {
            let own = &scheduler.stealers()[self.index];
            if let Some(task) = steal_into_local(|_| own.steal()) {
                return Some(task);
            }
        }

        if let Some(task) = pop_local() {
            return Some(task);
        }

        if let Some(task) = self.steal_from_peers() {
            self.shared.stats.record_steal();
            return Some(task);
        }

        steal_into_local(|local| scheduler.injector().steal_batch_and_pop(local))
    }

    fn steal_from_peers(&self) -> Option<Arc<Task>> {
        let stealers = self.shared.scheduler.stealers();
        let peers = stealers.len();
        if peers < 2 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..peers);
        (0..peers)
            .map(|offset| (start + offset) % peers)
            .filter(|&victim| victim != self.index)
            .find_map(|victim| steal_into_local(|_| stealers[victim].steal()))
    }

    fn run_task(&self, task: Arc<Task>) {
        if !task.begin_run() {
            return;
        }
        let record = task.record().clone();

        if !record.is_alive() {
            drop(task.complete());
            return;
        }
        if record.is_cancelled() {
            self.finish(&task, ExitReason::Kill);
            return;
        }

        record.set_state(ProcessState::Running);
        tracing::trace!(worker = self.index, pid = %record.pid(), "polling process");

        let polled = {
            let _current = CurrentPid::enter(record.pid());
            catch_unwind(AssertUnwindSafe(|| task.poll()))
        };

        match polled {
            Ok(Poll::Pending) => {
                // Requeued tasks are flipped back to Runnable by `end_run`.
                record.set_state(ProcessState::Blocked);
                task.end_run();
            }
            Ok(Poll::Ready(Ok(value))) => self.finish(&task, ExitReason::Normal(value)),
            Ok(Poll::Ready(Err(ProcessError::Killed))) => self.finish(&task, ExitReason::Kill),
            Ok(Poll::Ready(Err(error))) => {
                tracing::warn!(pid = %record.pid(), %error, "process exited with unhandled error");
                self.finish(&task, ExitReason::from_error(error))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(pid = %record.pid(), %message, "process panicked");
                self.finish(&task, ExitReason::from_error(ProcessError::Panicked(message)))
            }
        }
    }

    fn finish(&self, task: &Arc<Task>, reason: ExitReason) {
        let record = task.record();
        let pid = record.pid();
        let registry = &self.shared.registry;
        let stats = &self.shared.stats;
        if registry.terminate(record, reason.clone()) {
            match &reason {
                ExitReason::Kill => stats.record_kill(),
                ExitReason::Normal(_) => stats.record_finish(),
                ExitReason::Error(_) => stats.record_error(),
            }
            tracing::debug!(%pid, %reason, "process terminated");
        }

        record.cancel_token().clear_callbacks();
        let undelivered = record.mailbox().close();
        if undelivered > 0 {
            tracing::trace!(%pid, undelivered, "dropped undelivered messages");
        }
        let body = task.complete();
        drop(body);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
