//! Method dispatch.
//!
//! Each method decodes its params, calls one core operation and turns the
//! outcome into JSON. No business logic lives here.

use outpost_core::monitor::{no_prompts, run_monitored};
use outpost_core::transport::StreamKind;
use outpost_core::{AuditRecord, ExecutionResult, OutpostContext};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::protocol::{
    parse_params, ErrorBody, HostParams, IdParams, JobOutputParams, JobStartParams,
    OptionalHostParams, PathParams, RunParams, SnapshotListParams, StreamEvent,
};

/// Serialized lines headed for stdout.
pub type LineSender = mpsc::UnboundedSender<String>;

fn to_json<T: Serialize>(value: &T) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| ErrorBody::from(outpost_core::RemoteError::from(e)))
}

pub fn send_line<T: Serialize>(lines: &LineSender, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            // The receiver only goes away during shutdown.
            let _ = lines.send(line);
        }
        Err(err) => log::error!("Failed to serialize outgoing message: {err}"),
    }
}

pub async fn dispatch(
    ctx: &OutpostContext,
    id: &Value,
    method: &str,
    params: Value,
    lines: &LineSender,
) -> Result<Value, ErrorBody> {
    match method {
        "run" => run(ctx, id, parse_params(params)?, lines).await,
        "is_connected" => {
            let p: HostParams = parse_params(params)?;
            Ok(json!(ctx.pool.is_connected(&p.host)))
        }

        "job_start" => {
            let p: JobStartParams = parse_params(params)?;
            let job = ctx.jobs.start(&p.host, &p.command, p.name.as_deref()).await?;
            to_json(&job)
        }
        "job_status" => {
            let p: IdParams = parse_params(params)?;
            to_json(&ctx.jobs.get_status(&p.id).await?)
        }
        "job_output" => {
            let p: JobOutputParams = parse_params(params)?;
            let output = ctx.jobs.get_output(&p.id, p.tail).await?;
            Ok(json!({ "output": output }))
        }
        "job_list" => {
            let p: OptionalHostParams = parse_params(params)?;
            to_json(&ctx.jobs.list(p.host.as_deref()).await?)
        }
        "job_kill" => {
            let p: IdParams = parse_params(params)?;
            let killed = ctx.jobs.kill(&p.id).await?;
            Ok(json!({ "killed": killed }))
        }
        "job_cleanup" => {
            let p: IdParams = parse_params(params)?;
            ctx.jobs.cleanup(&p.id).await?;
            Ok(Value::Null)
        }

        "snapshot_create" => {
            let p: PathParams = parse_params(params)?;
            to_json(&ctx.snapshots.create(&p.host, &p.path).await?)
        }
        "snapshot_file" => {
            let p: PathParams = parse_params(params)?;
            to_json(&ctx.snapshots.create_file_snapshot(&p.host, &p.path).await?)
        }
        "snapshot_list" => {
            let p: SnapshotListParams = parse_params(params)?;
            to_json(&ctx.snapshots.list(p.host.as_deref(), p.limit)?)
        }
        "snapshot_restore" => {
            let p: IdParams = parse_params(params)?;
            let summary = ctx.snapshots.restore(&p.id).await?;
            Ok(json!({ "summary": summary }))
        }
        "snapshot_cleanup" => {
            let p: OptionalHostParams = parse_params(params)?;
            let removed = ctx.snapshots.cleanup(p.host.as_deref()).await?;
            Ok(json!({ "removed": removed }))
        }

        other => Err(ErrorBody::unknown_method(other)),
    }
}

async fn run(
    ctx: &OutpostContext,
    id: &Value,
    p: RunParams,
    lines: &LineSender,
) -> Result<Value, ErrorBody> {
    let stream = p.stream;
    let forward = |data: &[u8], kind: StreamKind| {
        if stream {
            send_line(
                lines,
                &StreamEvent {
                    id: id.clone(),
                    stream: kind,
                    data: String::from_utf8_lossy(data).into_owned(),
                },
            );
        }
    };

    let (result, monitored) = if p.monitor {
        let run = run_monitored(
            &ctx.executor,
            &p.host,
            &p.command,
            ctx.config.hang_timeout(),
            &no_prompts,
            forward,
        )
        .await?;
        (run.result, Some((run.alerts, run.awaiting_input)))
    } else {
        let result = ctx.executor.run_streaming(&p.host, &p.command, forward).await?;
        (result, None)
    };

    audit(ctx, &p.host, &p.command, &result);

    let mut value = to_json(&result)?;
    if let Some((alerts, awaiting_input)) = monitored {
        value["alerts"] = to_json(&alerts)?;
        value["awaitingInput"] = json!(awaiting_input);
    }
    Ok(value)
}

fn audit(ctx: &OutpostContext, host: &str, command: &str, result: &ExecutionResult) {
    let user = ctx
        .pool
        .host_config(host)
        .map(|h| h.username.as_str())
        .unwrap_or_default();
    let record = AuditRecord::from_execution(host, user, command, result);
    if let Err(err) = ctx.audit.record(&record) {
        log::warn!("[{host}] failed to write audit record: {err}");
    }
}

// ============================================================================
// TESTS
// ============================================================================
