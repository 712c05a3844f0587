//! Host end of one invocation's channel.
//!
//! The serve loop reads frames, validates each envelope and spawns one task
//! per request, so a slow operation never holds up the ones behind it.
//! Anything the protocol does not allow is fatal: the offending request is
//! answered with a `Protocol` error where its correlation id is known, and
//! the channel is torn down.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fence_proto::channel::{self, FrameWriter};
use fence_proto::{
    ErrorInfo, Hello, Op, Outcome, PROTOCOL_VERSION, RequestFrame, ResponseFrame, from_payload,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::invocation::{CloseReason, Invocation, Summary};
use crate::ops;

/// Correlation ids received but not yet answered.
type InFlight = Arc<Mutex<HashSet<u64>>>;

/// A request the serve loop refuses to handle.
#[derive(Debug)]
struct Violation {
    /// Correlation id to answer under; `None` when it is unknown or must
    /// not be answered twice.
    correlation: Option<u64>,
    /// Detail for the log and the guest.
    reason: String,
}

impl Violation {
    /// A violation answered under `correlation`.
    fn answer(correlation: u64, reason: String) -> Self {
        Self {
            correlation: Some(correlation),
            reason,
        }
    }

    /// A violation that gets no response.
    const fn silent(reason: String) -> Self {
        Self {
            correlation: None,
            reason,
        }
    }
}

/// Serves `inv` over `stream` until the guest closes, the deadline passes,
/// the guest violates the protocol, or `shutdown` turns true.
///
/// On return every request task has been aborted, the write side has been
/// closed (waiting at most `grace` for a stuck peer), and every handle of
/// the invocation has been dropped.
pub async fn serve<S>(
    inv: Arc<Invocation>,
    stream: S,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Summary
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = inv.id();
    let (mut reader, writer) = channel::split(stream);
    let in_flight = InFlight::default();
    let mut tasks = JoinSet::new();
    info!(invocation = %id, function = inv.function(), "invocation started");

    let reason = match writer.send(&Hello::new(id)).await {
        Err(e) => {
            debug!(invocation = %id, "hello not delivered: {e}");
            CloseReason::Completed
        }
        Ok(()) => {
            let deadline = tokio::time::sleep_until(inv.deadline());
            tokio::pin!(deadline);
            loop {
                // Only the frame read can be cancelled mid-way, and every
                // other branch ends the loop, so no partial frame is lost.
                let frame = tokio::select! {
                    () = &mut deadline => break CloseReason::Deadline,
                    () = stopped(&mut shutdown) => break CloseReason::Shutdown,
                    frame = reader.recv_frame() => frame,
                };
                reap(&mut tasks, &inv);

                let bytes = match frame {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break CloseReason::Completed,
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        warn!(invocation = %id, "bad frame: {e}");
                        break CloseReason::ProtocolViolation;
                    }
                    Err(e) => {
                        debug!(invocation = %id, "channel read failed: {e}");
                        break CloseReason::Completed;
                    }
                };

                match admit(&inv, &in_flight, &bytes) {
                    Ok((correlation, op)) => {
                        debug!(invocation = %id, correlation, op = op.opcode().name(), "request");
                        tasks.spawn(respond(
                            Arc::clone(&inv),
                            Arc::clone(&in_flight),
                            writer.clone(),
                            correlation,
                            op,
                        ));
                    }
                    Err(v) => {
                        warn!(invocation = %id, correlation = ?v.correlation, "protocol violation: {}", v.reason);
                        if let Some(correlation) = v.correlation {
                            let outcome = Outcome::Err(ErrorInfo::protocol(v.reason));
                            inv.record(&outcome);
                            let reply = ResponseFrame::new(correlation, outcome);
                            let _ = tokio::time::timeout(grace, writer.send(&reply)).await;
                        }
                        break CloseReason::ProtocolViolation;
                    }
                }
            }
        }
    };

    teardown(&inv, tasks, &writer, grace).await;
    let summary = inv.summary(reason);
    info!(
        invocation = %id,
        reason = %summary.reason,
        served = summary.served,
        denied = summary.denied,
        failed = summary.failed,
        elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
        "invocation ended"
    );
    summary
}

/// Resolves once `shutdown` is true or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

/// Validates one frame in envelope order and decodes its operation.
///
/// On success the correlation id is recorded as in flight.
fn admit(inv: &Invocation, in_flight: &InFlight, bytes: &[u8]) -> Result<(u64, Op), Violation> {
    let req: RequestFrame = from_payload(bytes).map_err(|e| Violation::silent(format!("undecodable envelope: {e}")))?;
    let correlation = req.correlation;
    if req.version != PROTOCOL_VERSION {
        return Err(Violation::answer(
            correlation,
            format!("protocol v{}, host speaks v{PROTOCOL_VERSION}", req.version),
        ));
    }
    if req.invocation != inv.id() {
        return Err(Violation::answer(
            correlation,
            format!("frame for invocation {}, channel serves {}", req.invocation, inv.id()),
        ));
    }
    let mut ids = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if ids.contains(&correlation) {
        return Err(Violation::silent(format!("correlation id {correlation} already in flight")));
    }
    let op = Op::decode(req.opcode, &req.args).map_err(|e| Violation::answer(correlation, e.to_string()))?;
    ids.insert(correlation);
    Ok((correlation, op))
}

/// Authorizes, executes and answers one request.
async fn respond(
    inv: Arc<Invocation>,
    in_flight: InFlight,
    writer: FrameWriter<impl AsyncWrite + Unpin>,
    correlation: u64,
    op: Op,
) {
    let name = op.opcode().name();
    let outcome = Outcome::from(match ops::authorize(&inv, &op) {
        Ok(permit) => ops::execute(&inv, op, permit).await,
        Err(e) => Err(e),
    });
    if let Outcome::Err(e) = &outcome {
        debug!(invocation = %inv.id(), correlation, op = name, "{e}");
    }
    inv.record(&outcome);

    // The id must be reusable by the time the guest sees the response.
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&correlation);
    if let Err(e) = writer.send(&ResponseFrame::new(correlation, outcome)).await {
        debug!(invocation = %inv.id(), correlation, "response dropped: {e}");
    }
}

/// Collects finished request tasks without waiting.
fn reap(tasks: &mut JoinSet<()>, inv: &Invocation) {
    while let Some(done) = tasks.try_join_next() {
        if let Err(e) = done {
            warn!(invocation = %inv.id(), "request task failed: {e}");
        }
    }
}

/// Abandons in-flight work and closes the channel.
async fn teardown<W: AsyncWrite + Unpin>(inv: &Invocation, mut tasks: JoinSet<()>, writer: &FrameWriter<W>, grace: Duration) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    if tokio::time::timeout(grace, writer.close()).await.is_err() {
        warn!(invocation = %inv.id(), "channel close timed out");
    }
    inv.handles().clear();
}
