//! Work-stealing deque re-exports.
//!
//! The scheduler keeps one [`Worker`] per OS thread, hands its [`Stealer`]
//! to the peers, and uses an [`Injector`] for tasks scheduled from outside
//! the pool.

pub use crossbeam::deque::{Injector, Steal, Stealer, Worker};
