//! Work-stealing scheduler.
//!
//! A fixed pool of worker threads runs process tasks. Each worker owns a
//! LIFO deque; tasks scheduled from a worker go to its own deque, tasks
//! scheduled from anywhere else go to the shared injector. Idle workers
//! steal from a random peer's FIFO end, then from the injector, and finally
//! park until something is pushed.

pub(crate) mod task;
pub(crate) mod timer;
pub(crate) mod worker;

use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use strand_rt::deque::{Injector, Stealer, Worker as LocalQueue};

use self::task::Task;

/// Upper bound on a park, in case a notification races past a parking worker.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Parked-worker bookkeeping. `sleeping` is read without the lock on every
/// push; the lock is only taken to hand a notification to a parked worker.
#[derive(Default)]
struct Idle {
    sleeping: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

pub(crate) struct Scheduler {
    id: u64,
    injector: Injector<Arc<Task>>,
    stealers: Vec<Stealer<Arc<Task>>>,
    idle: Idle,
    shutdown: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for `workers` threads. The returned local queues are
    /// handed one to each worker thread.
    pub(crate) fn new(workers: usize) -> (Self, Vec<LocalQueue<Arc<Task>>>) {
        let workers = workers.max(1);
        let locals: Vec<_> = (0..workers).map(|_| LocalQueue::new_lifo()).collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();
        let scheduler = Scheduler {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers,
            idle: Idle::default(),
            shutdown: AtomicBool::new(false),
        };
        (scheduler, locals)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn workers(&self) -> usize {
        self.stealers.len()
    }

    pub(crate) fn injector(&self) -> &Injector<Arc<Task>> {
        &self.injector
    }

    pub(crate) fn stealers(&self) -> &[Stealer<Arc<Task>>] {
        &self.stealers
    }

    /// Queue a runnable task: on the current worker's deque when called from
    /// one of this scheduler's workers, on the injector otherwise.
    pub(crate) fn push(&self, task: Arc<Task>) {
        if let Err(task) = worker::push_local(self.id, task) {
            self.injector.push(task);
        }
        self.notify_one();
    }

    fn notify_one(&self) {
        // Pairs with the fence in `park`: either the parker sees the pushed
        // task or we see the parker.
        fence(Ordering::SeqCst);
        if self.idle.sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.idle.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.idle.cond.notify_one();
    }

    fn has_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    /// Block the calling worker until work may be available.
    ///
    /// The sleeper is registered before the work check and the idle lock is
    /// held from the check until the wait, so a push that lands after the
    /// check always finds us and its notification cannot slip past.
    pub(crate) fn park(&self) {
        let guard = self.idle.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.idle.sleeping.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if !self.is_shutdown() && !self.has_work() {
            let _ = self
                .idle
                .cond
                .wait_timeout(guard, PARK_TIMEOUT)
                .unwrap_or_else(|e| e.into_inner());
        }
        self.idle.sleeping.fetch_sub(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn sleeping(&self) -> usize {
        self.idle.sleeping.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask every worker to exit after its current poll.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _guard = self.idle.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.idle.cond.notify_all();
    }

    /// Remove every task still waiting in the injector.
    pub(crate) fn drain_injector(&self) -> Vec<Arc<Task>> {
        let mut drained = Vec::new();
        loop {
            match self.injector.steal() {
                strand_rt::deque::Steal::Success(task) => drained.push(task),
                strand_rt::deque::Steal::Empty => break,
                strand_rt::deque::Steal::Retry => continue,
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_queue_per_worker() {
        let (scheduler, locals) = Scheduler::new(3);
        assert_eq!(scheduler.workers(), 3);
        assert_eq!(locals.len(), 3);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn zero_workers_still_gets_one() {
        let (scheduler, locals) = Scheduler::new(0);
        assert_eq!(scheduler.workers(), 1);
        assert_eq!(locals.len(), 1);
    }

    #[test]
    fn schedulers_get_distinct_ids() {
        let (a, _) = Scheduler::new(1);
        let (b, _) = Scheduler::new(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn park_returns_immediately_after_shutdown() {
        let (scheduler, _locals) = Scheduler::new(1);
        scheduler.shutdown();
        let started = std::time::Instant::now();
        scheduler.park();
        assert!(started.elapsed() < PARK_TIMEOUT);
    }

    fn detached_task() -> Arc<Task> {
        let registry = crate::registry::Registry::new(None, None);
        let record = registry.allocate().unwrap();
        Task::new(
            record,
            Box::pin(async { Ok(crate::value::Value::Nil) }),
            std::sync::Weak::new(),
        )
    }

    #[test]
    fn push_without_sleepers_skips_the_idle_lock() {
        let (scheduler, _locals) = Scheduler::new(1);
        let _held = scheduler.idle.lock.lock().unwrap();
        scheduler.push(detached_task());
        assert!(scheduler.has_work());
        assert_eq!(scheduler.sleeping(), 0);
    }

    #[test]
    fn parked_worker_wakes_on_push() {
        let (scheduler, _locals) = Scheduler::new(1);
        let scheduler = Arc::new(scheduler);

        let parker = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.park())
        };
        while scheduler.sleeping() == 0 {
            std::thread::yield_now();
        }
        scheduler.push(detached_task());

        parker.join().unwrap();
        assert_eq!(scheduler.sleeping(), 0);
        assert!(scheduler.has_work());
    }
}
