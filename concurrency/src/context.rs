//! Per-process execution context.
//!
//! Every process owns an [`Environment`] built from its function alone and a
//! [`ProcessContext`] handle through which its body talks to the runtime.
//! Nothing in either points back at the spawning process.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{ProcessError, RuntimeError};
use crate::function::FunctionRef;
use crate::mailbox::Receive;
use crate::pid::Pid;
use crate::registry::ProcessRecord;
use crate::runtime::Shared;
use crate::scheduler::timer::Sleep;
use crate::value::Value;

thread_local! {
    static CURRENT_PID: Cell<u64> = const { Cell::new(0) };
}

/// PID of the process running on this thread, or [`Pid::MAIN`] when called
/// outside any process.
pub fn current_pid() -> Pid {
    Pid::from_raw(CURRENT_PID.with(Cell::get))
}

/// Marks the calling thread as running `pid` until dropped.
pub(crate) struct CurrentPid {
    previous: u64,
}

impl CurrentPid {
    pub(crate) fn enter(pid: Pid) -> Self {
        let previous = CURRENT_PID.with(|current| current.replace(pid.id()));
        CurrentPid { previous }
    }
}

impl Drop for CurrentPid {
    fn drop(&mut self) {
        CURRENT_PID.with(|current| current.set(self.previous));
    }
}

/// Convert a millisecond count coming from user code into a duration.
pub(crate) fn millis(ms: i64, what: &str) -> Result<Duration, RuntimeError> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| RuntimeError::InvalidArgument(format!("{what} must be non-negative, got {ms}")))
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The private variable bindings of one process.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Environment {
    bindings: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `params` to `args` positionally, then add `declarations`.
    pub fn for_call(
        function: &str,
        params: &[String],
        args: Vec<Value>,
        declarations: Vec<(String, Value)>,
    ) -> Result<Self, RuntimeError> {
        if params.len() != args.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "{function} expects {} argument(s), got {}",
                params.len(),
                args.len()
            )));
        }
        let mut env = Environment::new();
        for (name, value) in params.iter().zip(args) {
            env.set(name.clone(), value);
        }
        for (name, value) in declarations {
            env.set(name, value);
        }
        Ok(env)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Bind `name`, returning the previous value if it was already bound.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.bindings.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.bindings.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Look up `name`, raising the usual error when it is unbound.
    pub fn lookup(&self, name: &str) -> Result<&Value, ProcessError> {
        self.get(name)
            .ok_or_else(|| ProcessError::raised(format!("undefined variable '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// ProcessContext
// ---------------------------------------------------------------------------

/// Handle a running process uses to reach the runtime.
///
/// Owned by the process body; it is never cloned or shared, so the
/// environment inside it stays private to the process.
pub struct ProcessContext {
    record: Arc<ProcessRecord>,
    env: Environment,
    shared: Arc<Shared>,
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pid", &self.record.pid())
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl ProcessContext {
    pub(crate) fn new(record: Arc<ProcessRecord>, env: Environment, shared: Arc<Shared>) -> Self {
        ProcessContext {
            record,
            env,
            shared,
        }
    }

    /// This process's PID (`self()`).
    pub fn pid(&self) -> Pid {
        self.record.pid()
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn spawn(&self, function: &FunctionRef, args: Vec<Value>) -> Result<Pid, RuntimeError> {
        self.shared.spawn(function, args)
    }

    pub fn send(&self, pid: Pid, value: &Value) -> bool {
        self.shared.send(pid, value)
    }

    /// Wait for the next message. Fails only if this process is killed.
    pub async fn receive(&self) -> Result<Value, ProcessError> {
        loop {
            let received = Receive::new(
                self.record.mailbox(),
                Some(self.record.cancel_token()),
                None,
            )
            .await?;
            if let Some(value) = received {
                return Ok(value);
            }
        }
    }

    /// Take the next message if one is already queued. Never suspends.
    pub fn try_receive(&self) -> Result<Option<Value>, ProcessError> {
        self.checkpoint()?;
        Ok(self.record.mailbox().try_take())
    }

    /// Number of messages waiting in this process's mailbox.
    pub fn mailbox_len(&self) -> usize {
        self.record.mailbox().len()
    }

    /// Wait up to `ms` milliseconds for the next message; `None` on timeout.
    pub async fn receive_timeout(&self, ms: i64) -> Result<Option<Value>, ProcessError> {
        let timeout = millis(ms, "receive timeout")?;
        let sleep = Sleep::new(self.shared.timers.clone(), timeout);
        Receive::new(
            self.record.mailbox(),
            Some(self.record.cancel_token()),
            Some(sleep),
        )
        .await
    }

    /// Suspend for at least `ms` milliseconds without holding a worker.
    pub async fn sleep(&self, ms: i64) -> Result<(), ProcessError> {
        let duration = millis(ms, "sleep duration")?;
        self.checkpoint()?;
        Sleep::new(self.shared.timers.clone(), duration).await;
        self.checkpoint()
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.shared.is_alive(pid)
    }

    pub fn kill(&self, pid: Pid) {
        self.shared.kill(pid)
    }

    pub fn process_count(&self) -> usize {
        self.shared.process_count()
    }

    /// Cancellation checkpoint: fails once this process has been killed.
    pub fn checkpoint(&self) -> Result<(), ProcessError> {
        if self.record.is_cancelled() {
            Err(ProcessError::Killed)
        } else {
            Ok(())
        }
    }

    /// Give the worker to other runnable processes, then carry on.
    pub async fn yield_now(&self) -> Result<(), ProcessError> {
        self.checkpoint()?;
        YieldNow { yielded: false }.await;
        self.checkpoint()
    }
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
