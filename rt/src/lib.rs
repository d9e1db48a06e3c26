//! Runtime primitives for the strand process runtime. Using this library
//! keeps the thread, deque and tracing crates out of the process runtime's
//! own code, so they can be swapped behind these re-exports.
//!
//! Currently, only the small set of functionality the scheduler needs is
//! exported. We may want to extend this as needed.

pub mod deque;
pub mod threads;
pub mod tracing;

pub use crate::threads::{sleep, CancellationToken};

/// Initialise tracing and run `f` on the calling thread.
pub fn run<R>(f: impl FnOnce() -> R) -> R {
    crate::tracing::init_tracing();

    f()
}
