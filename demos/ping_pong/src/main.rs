//! Ping-pong between two processes.
//!
//! The pinger sends `ROUNDS` pings carrying its own PID; the ponger answers
//! each one. When the rally is over the pinger stops the ponger and reports
//! back to the main process.

use std::collections::BTreeMap;

use strand_concurrency::{NativeFunction, Pid, ProcessError, Runtime, Value};

const ROUNDS: u64 = 5;

fn message(kind: &str, from: Pid) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("kind".to_string(), Value::from(kind));
    fields.insert("from".to_string(), Value::from(from.id()));
    Value::Object(fields)
}

fn field_pid(value: &Value) -> Result<Pid, ProcessError> {
    value
        .as_object()
        .and_then(|fields| fields.get("from"))
        .and_then(Value::as_number)
        .map(|id| Pid::from(id as u64))
        .ok_or_else(|| ProcessError::raised(format!("malformed message {value}")))
}

fn main() {
    strand_rt::run(|| {
        let runtime = match Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(%err, "failed to start runtime");
                return;
            }
        };

        let ponger = NativeFunction::new("ponger", |cx| async move {
            let mut served = 0u64;
            loop {
                let ping = cx.receive().await?;
                let kind = ping
                    .as_object()
                    .and_then(|fields| fields.get("kind"))
                    .and_then(Value::as_str);
                if kind == Some("stop") {
                    return Ok(Value::from(served));
                }
                let from = field_pid(&ping)?;
                tracing::info!(pid = %cx.pid(), %from, "Ponger received Ping, sending Pong");
                cx.send(from, &message("pong", cx.pid()));
                served += 1;
            }
        })
        .into_ref();

        let pinger = NativeFunction::new("pinger", |cx| async move {
            let ponger = Pid::from(cx.env().lookup("ponger")?.as_number().unwrap_or(0.0) as u64);
            for round in 1..=ROUNDS {
                cx.send(ponger, &message("ping", cx.pid()));
                let pong = cx.receive().await?;
                let from = field_pid(&pong)?;
                tracing::info!(round, %from, "Pinger received Pong");
            }
            cx.send(ponger, &message("stop", cx.pid()));
            cx.send(Pid::MAIN, &Value::from("done"));
            Ok(Value::from(ROUNDS))
        })
        .with_params(["ponger"])
        .into_ref();

        let spawned = runtime.spawn(&ponger, vec![]).and_then(|ponger| {
            let pinger = runtime.spawn(&pinger, vec![Value::from(ponger.id())])?;
            Ok((ponger, pinger))
        });
        let (ponger, pinger) = match spawned {
            Ok(pids) => pids,
            Err(err) => {
                tracing::error!(%err, "failed to spawn");
                return;
            }
        };

        let reply = runtime.receive();
        tracing::info!(%reply, "Main received");
        tracing::info!(
            ponger = ?runtime.wait(ponger, None),
            pinger = ?runtime.wait(pinger, None),
            "rally finished"
        );
        runtime.shutdown();
    })
}
