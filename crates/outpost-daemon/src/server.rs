//! Request loop.
//!
//! Every request runs in its own task, so a long command on one host never
//! holds up requests for another. A single writer task owns stdout; lines
//! from different requests never interleave.

use outpost_core::OutpostContext;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::handlers::{dispatch, send_line, LineSender};
use crate::protocol::{ErrorBody, Request, Response};

/// Serve requests from `reader` until EOF, then wait for in-flight requests
/// to answer.
pub async fn serve<R, W>(ctx: OutpostContext, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_lines(writer, rx));
    let mut in_flight = JoinSet::new();

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Rejecting malformed request: {err}");
                send_line(
                    &tx,
                    &Response::failure(Value::Null, ErrorBody::invalid_request(err.to_string())),
                );
                continue;
            }
        };

        in_flight.spawn(handle(ctx.clone(), request, tx.clone()));
        while in_flight.try_join_next().is_some() {}
    }

    log::info!("Input closed; waiting for {} request(s)", in_flight.len());
    while in_flight.join_next().await.is_some() {}
    drop(tx);

    writer_task.await.map_err(io::Error::other)?
}

async fn handle(ctx: OutpostContext, request: Request, lines: LineSender) {
    log::debug!("-> {} {}", request.id, request.method);
    let outcome = dispatch(&ctx, &request.id, &request.method, request.params, &lines).await;
    if let Err(err) = &outcome {
        log::debug!("<- {} {}: {}", request.id, err.kind, err.message);
    }
    send_line(&lines, &Response::from_outcome(request.id, outcome));
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
