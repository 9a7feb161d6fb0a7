//! The per-connection frame dispatch loop.
//!
//! Every incoming frame spawns a task so that a long-running call does not
//! block the frame reader; only the most recently spawned call-handling
//! task is ever the target of an interrupt (the "single-in-flight-request
//! policy" — a documented limitation, not an oversight: this worker never
//! needs to interrupt anything other than the call the manager is currently
//! waiting on).

use std::sync::{Arc, Mutex};

use sandbox_protocol::{CallBody, RemoteError, WireKind};
use sandbox_wire::{FrameReader, FrameWriter, ReadOutcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::registry::FunctionTable;

/// Tracks the single task eligible to receive an interrupt: the most
/// recently spawned call handler. Shared between the frame dispatch loop
/// (which sets it and fires it on a wire-level `0x14` frame) and, on Unix,
/// a SIGINT listener the worker binary installs so a process-level
/// interrupt targets the same call.
#[derive(Default)]
pub struct InterruptTarget {
    handle: Mutex<Option<(u64, AbortHandle)>>,
}

impl InterruptTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, id: u64, handle: AbortHandle) {
        *self.handle.lock().unwrap() = Some((id, handle));
    }

    /// Clear the tracked entry if it still belongs to `id`. Called once a
    /// call-handling task finishes on its own, so a later `fire()` can't
    /// mistake an already-completed call for the one still running.
    fn clear(&self, id: u64) {
        let mut guard = self.handle.lock().unwrap();
        if matches!(&*guard, Some((tracked, _)) if *tracked == id) {
            *guard = None;
        }
    }

    /// Abort the tracked task, if any, and return the id of the call it was
    /// running. The aborted future is dropped mid-flight and never gets to
    /// reply for itself, so the caller must send the failure on its behalf.
    pub fn fire(&self) -> Option<u64> {
        let (id, handle) = self.handle.lock().unwrap().take()?;
        handle.abort();
        Some(id)
    }
}

async fn reply_result<W>(writer: &AsyncMutex<FrameWriter<W>>, id: u64, bytes: &[u8])
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(err) = writer
        .write_frame(WireKind::Result.into(), id, bytes)
        .await
    {
        warn!(%err, id, "failed to write call result");
    }
}

pub(crate) async fn reply_failure<W>(writer: &AsyncMutex<FrameWriter<W>>, id: u64, err: &RemoteError)
where
    W: AsyncWrite + Unpin,
{
    let bytes = match postcard::to_stdvec(err) {
        Ok(bytes) => bytes,
        Err(encode_err) => {
            warn!(%encode_err, id, "failed to encode a RemoteError, dropping reply");
            return;
        }
    };
    let mut writer = writer.lock().await;
    if let Err(err) = writer
        .write_frame(WireKind::Failure.into(), id, &bytes)
        .await
    {
        warn!(%err, id, "failed to write call failure");
    }
}

async fn invoke(table: &FunctionTable, body: &CallBody) -> Result<Vec<u8>, RemoteError> {
    let handler = table
        .get(body.function)
        .ok_or(RemoteError::UnknownFunction)?;
    handler(body.args.clone()).await
}

/// Build the shared, lockable frame writer `run` and a SIGINT bridge can
/// both hold a handle to.
pub fn new_writer<W>(stream_out: W) -> Arc<AsyncMutex<FrameWriter<W>>>
where
    W: AsyncWrite + Unpin,
{
    Arc::new(AsyncMutex::new(FrameWriter::new(stream_out)))
}

/// Run the dispatch loop to completion; returns once the connection closes.
pub async fn run<R, W>(
    stream_in: R,
    writer: Arc<AsyncMutex<FrameWriter<W>>>,
    table: Arc<FunctionTable>,
    interrupts: Arc<InterruptTarget>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FrameReader::new(stream_in);

    loop {
        let outcome = match reader.read_frame().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "connection error while reading a frame, closing");
                return;
            }
        };

        let (kind, id, body) = match outcome {
            ReadOutcome::Frame { kind, id, body } => (kind, id, body),
            ReadOutcome::Closed => {
                trace!("peer closed the connection");
                return;
            }
        };

        let Ok(wire_kind) = WireKind::try_from(kind) else {
            warn!(kind, "unrecognized frame kind, dropping");
            continue;
        };

        match wire_kind {
            WireKind::CallWithReply | WireKind::CallNoReply => {
                let expect_reply = wire_kind == WireKind::CallWithReply;
                let call: Result<CallBody, _> = postcard::from_bytes(&body);
                let call = match call {
                    Ok(call) => call,
                    Err(err) => {
                        if expect_reply {
                            reply_failure(
                                &writer,
                                id,
                                &RemoteError::Serialization(err.to_string()),
                            )
                            .await;
                        } else {
                            debug!(%err, id, "dropping an undecodable call-no-reply body");
                        }
                        continue;
                    }
                };

                let table = table.clone();
                let writer = writer.clone();
                let task_interrupts = interrupts.clone();
                let task = tokio::spawn(async move {
                    let outcome = invoke(&table, &call).await;
                    task_interrupts.clear(id);
                    if !expect_reply {
                        return;
                    }
                    let result = if call.discard_result {
                        outcome.map(|_| Vec::new())
                    } else {
                        outcome
                    };
                    match result {
                        Ok(bytes) => reply_result(&writer, id, &bytes).await,
                        Err(err) => reply_failure(&writer, id, &err).await,
                    }
                });
                interrupts.set(id, task.abort_handle());
            }
            WireKind::Interrupt => {
                trace!(id, "interrupting the latest call");
                if let Some(interrupted_id) = interrupts.fire() {
                    reply_failure(&writer, interrupted_id, &RemoteError::Interrupted).await;
                }
            }
            WireKind::Result | WireKind::Failure => {
                warn!(kind, id, "worker received a reply-shaped frame, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_protocol::FunctionId;
    use tokio::io::duplex;

    fn make_table() -> Arc<FunctionTable> {
        let mut table = FunctionTable::new();
        table.register_sync("demo.add", |args| {
            let (a, b): (i32, i32) = postcard::from_bytes(&args).unwrap();
            Ok(postcard::to_stdvec(&(a + b)).unwrap())
        });
        table.register("demo.sleep_forever", |_args| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Vec::new())
            })
        });
        Arc::new(table)
    }

    #[tokio::test]
    async fn call_with_reply_returns_the_result() {
        let (client, server) = duplex(64 * 1024);
        let (client_rx, mut client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        tokio::spawn(run(
            server_rx,
            new_writer(server_tx),
            make_table(),
            InterruptTarget::new(),
        ));

        let mut writer = sandbox_wire::FrameWriter::new(&mut client_tx);
        let call = CallBody {
            function: FunctionId::for_name("demo.add"),
            args: postcard::to_stdvec(&(2i32, 3i32)).unwrap(),
            discard_result: false,
        };
        writer
            .write_frame(WireKind::CallWithReply.into(), 7, &postcard::to_stdvec(&call).unwrap())
            .await
            .unwrap();

        let mut reader = sandbox_wire::FrameReader::new(client_rx);
        let ReadOutcome::Frame { kind, id, body } = reader.read_frame().await.unwrap() else {
            panic!("expected a reply frame");
        };
        assert_eq!(kind, u8::from(WireKind::Result));
        assert_eq!(id, 7);
        let sum: i32 = postcard::from_bytes(&body).unwrap();
        assert_eq!(sum, 5);
    }

    #[tokio::test]
    async fn unknown_function_replies_with_failure() {
        let (client, server) = duplex(64 * 1024);
        let (client_rx, mut client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        tokio::spawn(run(
            server_rx,
            new_writer(server_tx),
            make_table(),
            InterruptTarget::new(),
        ));

        let mut writer = sandbox_wire::FrameWriter::new(&mut client_tx);
        let call = CallBody {
            function: FunctionId::for_name("does.not.exist"),
            args: Vec::new(),
            discard_result: false,
        };
        writer
            .write_frame(WireKind::CallWithReply.into(), 1, &postcard::to_stdvec(&call).unwrap())
            .await
            .unwrap();

        let mut reader = sandbox_wire::FrameReader::new(client_rx);
        let ReadOutcome::Frame { kind, body, .. } = reader.read_frame().await.unwrap() else {
            panic!("expected a reply frame");
        };
        assert_eq!(kind, u8::from(WireKind::Failure));
        let err: RemoteError = postcard::from_bytes(&body).unwrap();
        assert_eq!(err, RemoteError::UnknownFunction);
    }

    #[tokio::test]
    async fn interrupt_cancels_the_latest_call_and_the_loop_keeps_serving() {
        let (client, server) = duplex(64 * 1024);
        let (client_rx, mut client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        tokio::spawn(run(
            server_rx,
            new_writer(server_tx),
            make_table(),
            InterruptTarget::new(),
        ));

        let mut writer = sandbox_wire::FrameWriter::new(&mut client_tx);
        let mut reader = sandbox_wire::FrameReader::new(client_rx);

        let long_call = CallBody {
            function: FunctionId::for_name("demo.sleep_forever"),
            args: Vec::new(),
            discard_result: false,
        };
        writer
            .write_frame(
                WireKind::CallWithReply.into(),
                9,
                &postcard::to_stdvec(&long_call).unwrap(),
            )
            .await
            .unwrap();

        // Give the call handler a moment to start before interrupting it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer
            .write_frame(WireKind::Interrupt.into(), 0, &[])
            .await
            .unwrap();

        // The interrupted call (id 9) gets a synthesized failure reply before
        // the connection goes on to serve the next call normally.
        let ReadOutcome::Frame { kind, id, body } = reader.read_frame().await.unwrap() else {
            panic!("expected a reply frame");
        };
        assert_eq!(kind, u8::from(WireKind::Failure));
        assert_eq!(id, 9);
        let err: RemoteError = postcard::from_bytes(&body).unwrap();
        assert_eq!(err, RemoteError::Interrupted);

        let add_call = CallBody {
            function: FunctionId::for_name("demo.add"),
            args: postcard::to_stdvec(&(10i32, 20i32)).unwrap(),
            discard_result: false,
        };
        writer
            .write_frame(
                WireKind::CallWithReply.into(),
                10,
                &postcard::to_stdvec(&add_call).unwrap(),
            )
            .await
            .unwrap();

        let ReadOutcome::Frame { id, body, .. } = reader.read_frame().await.unwrap() else {
            panic!("expected a reply frame");
        };
        assert_eq!(id, 10);
        let sum: i32 = postcard::from_bytes(&body).unwrap();
        assert_eq!(sum, 30);
    }
}
