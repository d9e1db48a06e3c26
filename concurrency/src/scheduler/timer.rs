//! Deadline queue driven by a single timer thread.
//!
//! Sleeping processes and receive timeouts park their waker here instead of
//! holding a worker. The timer thread fires each waker once its deadline
//! has passed, which re-injects the owning task into the scheduler.
//!
//! Wakers live in a map keyed by entry id; the heap only orders ids by
//! deadline. Cancelling an entry drops its waker at once, and heap slots
//! left behind are skipped when they surface or pruned in bulk.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Dead heap slots tolerated beyond the live entries before a prune.
const PRUNE_SLACK: usize = 64;

#[derive(PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    wakers: HashMap<u64, Waker>,
    next_id: u64,
    shutdown: bool,
}

impl TimerState {
    fn prune(&mut self) {
        if self.heap.len() > 2 * self.wakers.len() + PRUNE_SLACK {
            let wakers = &self.wakers;
            self.heap.retain(|Reverse(entry)| wakers.contains_key(&entry.id));
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake `waker` once `deadline` has passed. Returns the entry id, or
    /// `None` once the queue has shut down.
    pub(crate) fn register(&self, deadline: Instant, waker: Waker) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return None;
        }
        let earliest = state
            .heap
            .peek()
            .map(|Reverse(entry)| deadline < entry.deadline)
            .unwrap_or(true);
        state.next_id += 1;
        let id = state.next_id;
        state.wakers.insert(id, waker);
        state.heap.push(Reverse(TimerEntry { deadline, id }));
        drop(state);
        if earliest {
            self.cond.notify_one();
        }
        Some(id)
    }

    /// Swap the waker of a pending entry. `false` if it already fired or was
    /// cancelled.
    pub(crate) fn update(&self, id: u64, waker: Waker) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.wakers.get_mut(&id) {
            Some(slot) => {
                *slot = waker;
                true
            }
            None => false,
        }
    }

    /// Forget a pending entry without firing it.
    pub(crate) fn cancel(&self, id: u64) {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let waker = state.wakers.remove(&id);
            if waker.is_some() {
                state.prune();
            }
            waker
        };
        drop(waker);
    }

    /// Number of entries that will still fire.
    pub(crate) fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .wakers
            .len()
    }

    /// Timer thread body. Returns after `shutdown`.
    pub(crate) fn run(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse(entry)) = state.heap.peek() {
                if entry.deadline > now {
                    break;
                }
                if let Some(Reverse(entry)) = state.heap.pop() {
                    if let Some(waker) = state.wakers.remove(&entry.id) {
                        due.push(waker);
                    }
                }
            }

            if !due.is_empty() {
                drop(state);
                tracing::trace!(count = due.len(), "firing timers");
                for waker in due {
                    waker.wake();
                }
                state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                continue;
            }

            let next = state
                .heap
                .peek()
                .map(|Reverse(entry)| entry.deadline.saturating_duration_since(now));
            state = match next {
                Some(wait) => {
                    self.cond
                        .wait_timeout(state, wait)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    /// Stop the timer thread and drop every pending waker.
    pub(crate) fn shutdown(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            state.heap.clear();
            std::mem::take(&mut state.wakers)
        };
        self.cond.notify_all();
        drop(pending);
    }
}

/// Future that completes once its deadline has passed.
///
/// A duration too large to represent as an `Instant` never completes.
/// Dropping a pending `Sleep` cancels its timer entry.
pub(crate) struct Sleep {
    deadline: Option<Instant>,
    timers: Arc<TimerQueue>,
    entry: Option<u64>,
    registered: Option<Waker>,
}

impl Sleep {
    pub(crate) fn new(timers: Arc<TimerQueue>, duration: Duration) -> Self {
        Sleep {
            deadline: Instant::now().checked_add(duration),
            timers,
            entry: None,
            registered: None,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(deadline) = this.deadline else {
            return Poll::Pending;
        };
        if Instant::now() >= deadline {
            return Poll::Ready(());
        }
        let fresh = match &this.registered {
            Some(waker) => waker.will_wake(cx.waker()),
            None => false,
        };
        if !fresh {
            let updated = this
                .entry
                .is_some_and(|id| this.timers.update(id, cx.waker().clone()));
            if !updated {
                this.entry = this.timers.register(deadline, cx.waker().clone());
            }
            this.registered = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.entry.take() {
            self.timers.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn start(timers: &Arc<TimerQueue>) -> thread::JoinHandle<()> {
        let timers = timers.clone();
        thread::spawn(move || timers.run())
    }

    #[test]
    fn sleep_completes_after_deadline() {
        let timers = TimerQueue::new();
        let handle = start(&timers);

        let started = Instant::now();
        futures::executor::block_on(Sleep::new(timers.clone(), Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));

        timers.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn earlier_deadline_fires_first() {
        let timers = TimerQueue::new();
        let handle = start(&timers);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut sleepers = Vec::new();
        for (label, ms) in [("slow", 60u64), ("fast", 10u64)] {
            let timers = timers.clone();
            let order = order.clone();
            sleepers.push(thread::spawn(move || {
                futures::executor::block_on(Sleep::new(timers, Duration::from_millis(ms)));
                order.lock().unwrap().push(label);
            }));
        }
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);

        timers.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_drops_pending_entries() {
        let timers = TimerQueue::new();
        let handle = start(&timers);
        timers.register(
            Instant::now() + Duration::from_secs(3600),
            futures::task::noop_waker(),
        );
        assert_eq!(timers.pending(), 1);

        timers.shutdown();
        handle.join().unwrap();
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn dropping_a_pending_sleep_cancels_its_entry() {
        let timers = TimerQueue::new();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut sleep = Sleep::new(timers.clone(), Duration::from_secs(3600));
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(timers.pending(), 1);

        drop(sleep);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn cancelled_entries_are_pruned_from_the_heap() {
        let timers = TimerQueue::new();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        for _ in 0..1_000 {
            let mut sleep = Sleep::new(timers.clone(), Duration::from_secs(3600));
            assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        }

        assert_eq!(timers.pending(), 0);
        let heap = timers.state.lock().unwrap().heap.len();
        assert!(heap <= PRUNE_SLACK + 1, "heap kept {heap} dead slots");
    }

    #[test]
    fn unrepresentable_deadline_never_fires() {
        let timers = TimerQueue::new();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut sleep = Sleep::new(timers.clone(), Duration::MAX);
        assert!(Pin::new(&mut sleep).poll(&mut cx).is_pending());
        assert_eq!(timers.pending(), 0);
    }
}
