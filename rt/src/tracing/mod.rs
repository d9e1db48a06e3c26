//! Tracing initializer
//!

use std::str::FromStr;

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
pub fn init_tracing() {
    let directive = match Directive::from_str("info") {
        Ok(directive) => directive,
        Err(_) => return,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(directive)
                .from_env_lossy(),
        )
        .with_thread_names(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
