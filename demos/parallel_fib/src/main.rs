//! Computes `fib(n)` in several processes at once and compares the wall time
//! against a single process, showing the work really runs in parallel.
//!
//! Usage: `parallel_fib [n] [processes]` (defaults: 30, 4).

use std::time::{Duration, Instant};

use strand_concurrency::{ExitReason, FunctionRef, NativeFunction, Pid, Runtime, RuntimeConfig, Value};

fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

fn fib_worker() -> FunctionRef {
    NativeFunction::new("fib", |cx| async move {
        let n = cx.receive().await?.as_number().unwrap_or(0.0) as u64;
        Ok(Value::from(fib(n)))
    })
    .into_ref()
}

fn run_batch(runtime: &Runtime, worker: &FunctionRef, n: u64, count: usize) -> Option<Duration> {
    let start = Instant::now();
    let mut pids: Vec<Pid> = Vec::with_capacity(count);
    for _ in 0..count {
        match runtime.spawn(worker, vec![]) {
            Ok(pid) => pids.push(pid),
            Err(err) => {
                tracing::error!(%err, "spawn failed");
                return None;
            }
        }
    }
    for pid in &pids {
        runtime.send(*pid, &Value::from(n));
    }

    let mut last = runtime.process_count();
    while last > 0 {
        runtime.sleep(1).ok()?;
        let now = runtime.process_count();
        if now < last {
            tracing::info!(running = now, "process count");
            last = now;
        }
    }

    for pid in pids {
        match runtime.reap(pid) {
            Some(ExitReason::Normal(value)) => tracing::debug!(%pid, %value, "result"),
            other => tracing::warn!(%pid, ?other, "unexpected exit"),
        }
    }
    Some(start.elapsed())
}

fn main() {
    let mut args = std::env::args().skip(1);
    let n = args.next().and_then(|a| a.parse().ok()).unwrap_or(30);
    let count = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);

    strand_rt::run(|| {
        let runtime = match Runtime::with_config(RuntimeConfig::from_env()) {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(%err, "failed to start runtime");
                return;
            }
        };
        let worker = fib_worker();
        tracing::info!(workers = runtime.workers(), n, count, "computing fib");

        let Some(single) = run_batch(&runtime, &worker, n, 1) else {
            return;
        };
        let Some(parallel) = run_batch(&runtime, &worker, n, count) else {
            return;
        };

        tracing::info!(?single, ?parallel, "done");
        tracing::info!(
            speedup = count as f64 * single.as_secs_f64() / parallel.as_secs_f64(),
            stats = ?runtime.stats(),
            "summary"
        );
    })
}
