//! # strand-concurrency
//!
//! Lightweight processes for Rust, multiplexed onto a small pool of worker
//! threads.
//!
//! A process is a function running in its own private [`Environment`], with a
//! FIFO mailbox and a [`Pid`]. Processes share nothing: the only way to talk
//! to one is to [`send`](Runtime::send) it a [`Value`], which is deep-copied
//! into the receiver's mailbox.
//!
//! ## Core Concepts
//!
//! ### Process Identification
//!
//! Every process gets a unique [`Pid`] when spawned. PIDs are never reused
//! within a runtime. PID 0 is the main process: the thread that owns the
//! [`Runtime`].
//!
//! ### Suspension
//!
//! Process bodies are futures. Waiting in [`ProcessContext::receive`],
//! [`ProcessContext::receive_timeout`] or [`ProcessContext::sleep`] parks the
//! process, not the worker thread, so a handful of workers can host many
//! thousands of blocked processes.
//!
//! ### Killing
//!
//! [`Runtime::kill`] is cooperative. The target terminates the next time it
//! reaches a suspension point or a [`checkpoint`](ProcessContext::checkpoint).
//! Its record then reports [`ProcessState::Killed`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand_concurrency::{NativeFunction, Runtime, Value};
//!
//! let runtime = Runtime::new()?;
//! let double = NativeFunction::new("double", |cx| async move {
//!     let n = cx.env().lookup("n")?.as_number().unwrap_or(0.0);
//!     cx.send(0.into(), &Value::from(n * 2.0));
//!     Ok(Value::Nil)
//! })
//! .with_params(["n"])
//! .into_ref();
//!
//! runtime.spawn(&double, vec![Value::from(21)])?;
//! assert_eq!(runtime.receive(), Value::from(42));
//! ```
//!
//! ## Configuration
//!
//! [`RuntimeConfig`] sets the worker count, an optional process limit and how
//! long records of terminated processes stay queryable. See
//! [`RuntimeConfig::from_env`] for the environment overrides.

pub mod config;
pub mod context;
pub mod error;
pub mod function;
mod mailbox;
pub mod pid;
mod registry;
mod runtime;
mod scheduler;
pub mod stats;
pub mod value;


pub use config::RuntimeConfig;
pub use context::{current_pid, Environment, ProcessContext};
pub use error::{ProcessError, RuntimeError};
pub use function::{Function, FunctionRef, NativeFunction, ProcessFuture};
pub use pid::{ExitReason, Pid, ProcessState};
pub use runtime::Runtime;
pub use stats::RuntimeStats;
pub use value::Value;
