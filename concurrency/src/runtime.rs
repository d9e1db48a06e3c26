//! The lifecycle controller: spawn, send, receive, self, is_alive, kill,
//! process_count and sleep, on top of the registry and the scheduler.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand_rt::threads::{self as rt, JoinHandle};

use crate::config::RuntimeConfig;
use crate::context::{current_pid, millis, ProcessContext};
use crate::error::RuntimeError;
use crate::function::FunctionRef;
use crate::mailbox::Receive;
use crate::pid::{ExitReason, Pid, ProcessState};
use crate::registry::Registry;
use crate::scheduler::task::Task;
use crate::scheduler::timer::{Sleep, TimerQueue};
use crate::scheduler::worker::Worker;
use crate::scheduler::Scheduler;
use crate::stats::{RuntimeStats, Stats};
use crate::value::Value;

/// State shared by the `Runtime`, its worker threads and every process.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) scheduler: Scheduler,
    pub(crate) timers: Arc<TimerQueue>,
    pub(crate) stats: Stats,
}

impl Shared {
    pub(crate) fn spawn(
        self: &Arc<Self>,
        function: &FunctionRef,
        args: Vec<Value>,
    ) -> Result<Pid, RuntimeError> {
        let env = function.fresh_context(args)?;
        let record = self.registry.allocate()?;
        let pid = record.pid();

        let cx = ProcessContext::new(record.clone(), env, self.clone());
        let task = Task::new(record.clone(), function.execute(cx), Arc::downgrade(self));
        record.attach_task(&task);

        let on_kill = task.clone();
        record
            .cancel_token()
            .on_cancel(Box::new(move || on_kill.wake_task()));

        self.stats.record_spawn();
        tracing::trace!(%pid, function = function.name(), "spawned process");
        self.scheduler.push(task);
        Ok(pid)
    }

    pub(crate) fn send(&self, pid: Pid, value: &Value) -> bool {
        let Some(record) = self.registry.lookup(pid) else {
            return false;
        };
        if !record.is_alive() || !record.mailbox().post(value) {
            return false;
        }
        self.stats.record_message();
        true
    }

    pub(crate) fn is_alive(&self, pid: Pid) -> bool {
        self.registry
            .lookup(pid)
            .is_some_and(|record| record.is_alive())
    }

    pub(crate) fn kill(&self, pid: Pid) {
        if pid.is_main() {
            return;
        }
        if let Some(record) = self.registry.lookup(pid) {
            if record.is_alive() && record.cancel_token().cancel() {
                tracing::debug!(%pid, "kill requested");
            }
        }
    }

    pub(crate) fn process_count(&self) -> usize {
        self.registry.count_active()
    }
}

/// A running process runtime.
///
/// The thread that owns the `Runtime` acts as the main process, PID 0: it can
/// spawn, send, receive and sleep like any other process, except that its
/// waits block the calling OS thread. Dropping the runtime shuts it down.
///
/// ```ignore
/// let runtime = Runtime::new()?;
/// let echo = NativeFunction::new("echo", |cx| async move { cx.receive().await }).into_ref();
/// let pid = runtime.spawn(&echo, vec![])?;
/// runtime.send(pid, &Value::from("ping"));
/// assert_eq!(runtime.wait(pid, None), Some(ExitReason::Normal(Value::from("ping"))));
/// ```
pub struct Runtime {
    shared: Arc<Shared>,
    /// The main mailbox holds one waiter; OS threads receiving on it queue here.
    main_receiver: Mutex<()>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.workers.len())
            .field("processes", &self.process_count())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Start a runtime with one worker per available CPU.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let workers = config.resolved_workers();
        let (scheduler, queues) = Scheduler::new(workers);
        let shared = Arc::new(Shared {
            registry: Registry::new(config.max_processes, config.retention),
            scheduler,
            timers: TimerQueue::new(),
            stats: Stats::default(),
        });

        let mut runtime = Runtime {
            shared: shared.clone(),
            main_receiver: Mutex::new(()),
            workers: Vec::with_capacity(workers),
            timer: None,
        };

        let timers = shared.timers.clone();
        runtime.timer = Some(
            rt::spawn_named(format!("{}-timer", config.thread_name), move || timers.run())
                .map_err(thread_error)?,
        );

        for (index, queue) in queues.into_iter().enumerate() {
            let worker = Worker::new(index, shared.clone());
            let handle = rt::spawn_named(format!("{}-worker-{}", config.thread_name, index), move || {
                worker.run(queue)
            })
            .map_err(thread_error)?;
            runtime.workers.push(handle);
        }

        tracing::debug!(workers, "runtime started");
        Ok(runtime)
    }

    /// Start `function` as a new process and return its PID right away.
    pub fn spawn(&self, function: &FunctionRef, args: Vec<Value>) -> Result<Pid, RuntimeError> {
        self.shared.spawn(function, args)
    }

    /// Post a copy of `value` to `pid`. `false` if the process is unknown or
    /// has terminated.
    pub fn send(&self, pid: Pid, value: &Value) -> bool {
        self.shared.send(pid, value)
    }

    /// Block until a message arrives for the main process.
    ///
    /// Several OS threads may receive on the main process at once; they are
    /// served one at a time, each taking the next message.
    pub fn receive(&self) -> Value {
        let _receiver = self.main_receiver.lock().unwrap_or_else(|e| e.into_inner());
        let main = self.shared.registry.main();
        loop {
            if let Ok(Some(value)) = futures::executor::block_on(Receive::new(main.mailbox(), None, None)) {
                return value;
            }
        }
    }

    /// Block up to `ms` milliseconds for a message to the main process.
    pub fn receive_timeout(&self, ms: i64) -> Result<Option<Value>, RuntimeError> {
        let timeout = millis(ms, "receive timeout")?;
        let _receiver = self.main_receiver.lock().unwrap_or_else(|e| e.into_inner());
        let main = self.shared.registry.main();
        let sleep = Sleep::new(self.shared.timers.clone(), timeout);
        let received = futures::executor::block_on(Receive::new(main.mailbox(), None, Some(sleep)));
        Ok(received.unwrap_or(None))
    }

    /// Take the next message for the main process if one is queued.
    pub fn try_receive(&self) -> Option<Value> {
        self.shared.registry.main().mailbox().try_take()
    }

    /// Messages waiting in `pid`'s mailbox, or `None` for an unknown PID.
    pub fn mailbox_len(&self, pid: Pid) -> Option<usize> {
        self.shared
            .registry
            .lookup(pid)
            .map(|record| record.mailbox().len())
    }

    /// PID of the calling process: 0 on the main thread.
    pub fn self_pid(&self) -> Pid {
        current_pid()
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.shared.is_alive(pid)
    }

    /// Request cooperative termination of `pid`.
    pub fn kill(&self, pid: Pid) {
        self.shared.kill(pid)
    }

    pub fn process_count(&self) -> usize {
        self.shared.process_count()
    }

    /// Put the main thread to sleep for `ms` milliseconds.
    pub fn sleep(&self, ms: i64) -> Result<(), RuntimeError> {
        let duration = millis(ms, "sleep duration")?;
        rt::sleep(duration);
        Ok(())
    }

    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.shared.registry.lookup(pid).map(|record| record.state())
    }

    /// How a terminated process exited. `None` while it runs, or once its
    /// record has been reaped.
    pub fn result(&self, pid: Pid) -> Option<ExitReason> {
        self.shared
            .registry
            .lookup(pid)
            .and_then(|record| record.exit_reason())
    }

    /// Block until `pid` terminates or `timeout` elapses.
    pub fn wait(&self, pid: Pid, timeout: Option<Duration>) -> Option<ExitReason> {
        if pid.is_main() {
            return None;
        }
        self.shared.registry.lookup(pid)?.wait(timeout)
    }

    /// Forget a terminated process, returning how it exited.
    pub fn reap(&self, pid: Pid) -> Option<ExitReason> {
        let reason = self.shared.registry.reap(pid)?;
        tracing::debug!(%pid, "reaped process");
        Some(reason)
    }

    /// Evict terminated processes older than the retention period now.
    pub fn sweep(&self) -> usize {
        self.shared.registry.sweep(Instant::now())
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats.snapshot(
            self.shared.registry.count_active(),
            self.shared.registry.retained(),
            self.shared.scheduler.workers(),
            self.shared.timers.pending(),
        )
    }

    pub fn workers(&self) -> usize {
        self.shared.scheduler.workers()
    }

    /// Kill every process, stop the workers and the timer, and wait for them.
    ///
    /// Processes stuck in code that never reaches a checkpoint keep their
    /// worker busy, and this call waits for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() && self.timer.is_none() {
            return;
        }
        let shared = &self.shared;
        shared.registry.close();

        let live = shared.registry.live();
        for record in &live {
            record.cancel_token().cancel();
        }

        shared.scheduler.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        shared.timers.shutdown();
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }

        for record in shared.registry.drain() {
            if shared.registry.terminate(&record, ExitReason::Kill) {
                shared.stats.record_kill();
            }
            record.cancel_token().clear_callbacks();
            record.mailbox().close();
            if let Some(task) = record.task() {
                drop(task.complete());
            }
        }
        for task in shared.scheduler.drain_injector() {
            drop(task.complete());
        }
        shared.registry.main().mailbox().close();

        tracing::debug!(killed = live.len(), "runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn thread_error(err: std::io::Error) -> RuntimeError {
    RuntimeError::ResourceExhausted(format!("failed to start runtime thread: {err}"))
}
