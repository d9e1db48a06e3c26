//! Runtime configuration.

use std::time::Duration;

const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

pub const WORKERS_ENV: &str = "STRAND_WORKERS";
pub const MAX_PROCESSES_ENV: &str = "STRAND_MAX_PROCESSES";
pub const RETENTION_ENV: &str = "STRAND_RETENTION_MS";

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = use available CPUs).
    pub workers: usize,
    /// Maximum number of live processes; `spawn` past it fails with
    /// `ResourceExhausted`.
    pub max_processes: Option<usize>,
    /// How long records of terminated processes are kept for queries.
    /// `None` keeps them until reaped.
    pub retention: Option<Duration>,
    /// Prefix for worker and timer thread names.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_processes: None,
            retention: Some(DEFAULT_RETENTION),
            thread_name: "strand".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `STRAND_WORKERS`, `STRAND_MAX_PROCESSES` and
    /// `STRAND_RETENTION_MS`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(workers) = parse_var(&lookup, WORKERS_ENV) {
            self.workers = workers;
        }
        if let Some(max) = parse_var(&lookup, MAX_PROCESSES_ENV) {
            self.max_processes = Some(max);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, RETENTION_ENV) {
            self.retention = Some(Duration::from_millis(ms));
        }
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn max_processes(mut self, max: usize) -> Self {
        self.max_processes = Some(max);
        self
    }

    pub fn retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// The worker count with auto-detection applied.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            strand_rt::threads::available_parallelism()
        } else {
            self.workers
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(vars: &[(&str, &str)]) -> RuntimeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::default().with_overrides(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_processes, None);
        assert_eq!(config.retention, Some(DEFAULT_RETENTION));
        assert!(config.resolved_workers() >= 1);
    }

    #[test]
    fn builder_methods() {
        let config = RuntimeConfig::new()
            .workers(3)
            .max_processes(10)
            .retention(None)
            .thread_name("test");
        assert_eq!(config.resolved_workers(), 3);
        assert_eq!(config.max_processes, Some(10));
        assert_eq!(config.retention, None);
        assert_eq!(config.thread_name, "test");
    }

    #[test]
    fn env_overrides_apply() {
        let config = overrides(&[
            (WORKERS_ENV, "2"),
            (MAX_PROCESSES_ENV, "100"),
            (RETENTION_ENV, "1500"),
        ]);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_processes, Some(100));
        assert_eq!(config.retention, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unparsable_env_values_are_ignored() {
        let config = overrides(&[(WORKERS_ENV, "many"), (RETENTION_ENV, "-5")]);
        assert_eq!(config, RuntimeConfig::default());
    }
}
