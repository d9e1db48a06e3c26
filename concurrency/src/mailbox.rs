//! Per-process FIFO mailbox.
//!
//! Any thread may post into a mailbox; only the owning process takes from
//! it. The owner waits by leaving its task waker in the single waiter slot,
//! so a blocked receiver never holds a worker thread.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use strand_rt::CancellationToken;

use crate::error::ProcessError;
use crate::scheduler::timer::Sleep;
use crate::value::Value;

#[derive(Default)]
struct MailboxInner {
    queue: VecDeque<Value>,
    waiter: Option<Waker>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue a deep copy of `value` and wake the waiting owner, if any.
    ///
    /// Never blocks. Returns `false` once the mailbox has been closed.
    pub(crate) fn post(&self, value: &Value) -> bool {
        let copy = value.deep_copy();
        let waiter = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return false;
            }
            inner.queue.push_back(copy);
            inner.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
        true
    }

    pub(crate) fn try_take(&self) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .pop_front()
    }

    /// Pop the oldest value, or register `cx`'s waker for the next post.
    ///
    /// The emptiness check and the waker registration happen under one lock,
    /// so a concurrent `post` is never missed.
    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Value> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = inner.queue.pop_front() {
            return Poll::Ready(value);
        }
        match &inner.waiter {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => inner.waiter = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    fn clear_waiter(&self) {
        let waiter = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiter
            .take();
        drop(waiter);
    }

    /// Reject further posts and drop anything still queued.
    ///
    /// Returns the number of undelivered values.
    pub(crate) fn close(&self) -> usize {
        let (dropped, waiter) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
            (std::mem::take(&mut inner.queue), inner.waiter.take())
        };
        drop(waiter);
        dropped.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

/// Future returned by a receive: the next value, `None` on timeout, or
/// `Killed` once the owner's cancellation token fires.
pub(crate) struct Receive<'a> {
    mailbox: &'a Mailbox,
    cancel: Option<&'a CancellationToken>,
    timeout: Option<Sleep>,
}

impl<'a> Receive<'a> {
    pub(crate) fn new(
        mailbox: &'a Mailbox,
        cancel: Option<&'a CancellationToken>,
        timeout: Option<Sleep>,
    ) -> Self {
        Receive {
            mailbox,
            cancel,
            timeout,
        }
    }
}

impl Future for Receive<'_> {
    type Output = Result<Option<Value>, ProcessError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancel.is_some_and(CancellationToken::is_cancelled) {
            return Poll::Ready(Err(ProcessError::Killed));
        }
        if let Poll::Ready(value) = this.mailbox.poll_take(cx) {
            return Poll::Ready(Ok(Some(value)));
        }
        if let Some(timeout) = this.timeout.as_mut() {
            if Pin::new(timeout).poll(cx).is_ready() {
                return Poll::Ready(Ok(None));
            }
        }
        Poll::Pending
    }
}

impl Drop for Receive<'_> {
    fn drop(&mut self) {
        self.mailbox.clear_waiter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::timer::TimerQueue;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn values_come_out_in_post_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            assert!(mailbox.post(&Value::from(i)));
        }
        assert_eq!(mailbox.len(), 5);
        for i in 0..5 {
            assert_eq!(mailbox.try_take(), Some(Value::from(i)));
        }
        assert_eq!(mailbox.try_take(), None);
    }

    #[test]
    fn post_stores_an_independent_copy() {
        let mailbox = Mailbox::new();
        let mut payload = Value::Array(vec![Value::from(1)]);
        mailbox.post(&payload);

        if let Value::Array(items) = &mut payload {
            items.push(Value::from(2));
        }

        assert_eq!(mailbox.try_take(), Some(Value::Array(vec![Value::from(1)])));
    }

    #[test]
    fn closed_mailbox_rejects_posts_and_drops_queue() {
        let mailbox = Mailbox::new();
        mailbox.post(&Value::from("a"));
        mailbox.post(&Value::from("b"));

        assert_eq!(mailbox.close(), 2);
        assert!(mailbox.is_closed());
        assert!(!mailbox.post(&Value::from("c")));
        assert_eq!(mailbox.try_take(), None);
    }

    #[test]
    fn blocked_receive_is_woken_by_post() {
        let mailbox = Arc::new(Mailbox::new());
        let poster = mailbox.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post(&Value::from("ping"));
        });

        let received = futures::executor::block_on(Receive::new(&mailbox, None, None));
        assert_eq!(received, Ok(Some(Value::from("ping"))));
        handle.join().unwrap();
    }

    #[test]
    fn receive_times_out_with_none() {
        let timers = TimerQueue::new();
        let runner = timers.clone();
        let handle = thread::spawn(move || runner.run());

        let mailbox = Mailbox::new();
        let timeout = Sleep::new(timers.clone(), Duration::from_millis(20));
        let received = futures::executor::block_on(Receive::new(&mailbox, None, Some(timeout)));
        assert_eq!(received, Ok(None));

        timers.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn receive_fails_once_cancelled() {
        let mailbox = Mailbox::new();
        mailbox.post(&Value::from(1));
        let token = CancellationToken::new();
        token.cancel();

        let received = futures::executor::block_on(Receive::new(&mailbox, Some(&token), None));
        assert_eq!(received, Err(ProcessError::Killed));
    }

    #[test]
    fn dropping_receive_clears_waiter() {
        let mailbox = Mailbox::new();
        {
            let mut receive = Receive::new(&mailbox, None, None);
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut receive).poll(&mut cx).is_pending());
            assert!(mailbox.inner.lock().unwrap().waiter.is_some());
        }
        assert!(mailbox.inner.lock().unwrap().waiter.is_none());
    }
}
