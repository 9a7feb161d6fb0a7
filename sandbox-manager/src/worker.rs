//! The manager-side worker handle (§4.3) and its lifecycle (§4.5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use maitake_sync::{wait_map::WakeOutcome, WaitMap};
use sandbox_protocol::{control_ops, CallBody, FunctionId, RemoteError, WireKind};
use sandbox_wire::{FrameReader, FrameWriter, ReadOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::config::WorkerConfig;
use crate::error::{CallError, SpawnError, TerminatedWorker, WaitForExitTimeout};

/// Grace period the receive task waits, after the socket closes with the
/// process still apparently alive, before force-killing it. The connection
/// is the only control channel once it drops, so a half-open state is
/// treated as unrecoverable (§7, "Transport failure").
const TRANSPORT_FAILURE_GRACE: Duration = Duration::from_millis(500);

/// Outcome the receive task delivers into a pending call's slot.
#[derive(Debug, Clone)]
pub(crate) enum WorkerResult {
    Ok(Vec<u8>),
    Raise(RemoteError),
}

struct Inner {
    child: AsyncMutex<Child>,
    pid: u32,
    writer: AsyncMutex<FrameWriter<OwnedWriteHalf>>,
    next_id: AtomicU64,
    pending: Arc<WaitMap<u64, WorkerResult>>,
    running: Arc<AtomicBool>,
    span: Span,
    /// Cancelled from `Drop for Inner`, so the receive task's blocking read
    /// (which holds only a `Weak<Inner>`, not a strong one) is woken up once
    /// the last `Worker` handle goes away instead of leaking the child
    /// forever while the socket stays open.
    cancel: CancellationToken,
}

/// A handle to one sandboxed worker process.
///
/// Cheap to clone: all state lives behind an `Arc`, so a clone shares the
/// same child process, socket, and pending-call map as the original.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

fn encode_call(function: &str, args: &impl Serialize, discard_result: bool) -> Result<Vec<u8>, CallError> {
    let args = postcard::to_stdvec(args).map_err(CallError::Encode)?;
    let call = CallBody {
        function: FunctionId::for_name(function),
        args,
        discard_result,
    };
    postcard::to_stdvec(&call).map_err(CallError::Encode)
}

fn decode_worker_result<T: DeserializeOwned>(result: WorkerResult) -> Result<T, CallError> {
    match result {
        WorkerResult::Ok(bytes) => postcard::from_bytes(&bytes).map_err(CallError::Decode),
        WorkerResult::Raise(err) => Err(CallError::Remote(err)),
    }
}

/// Read the worker's port-handshake line, bounded by `timeout`. Returns the
/// captured stderr alongside a spawn failure so callers can diagnose why
/// the process exited (matches concrete scenario 5).
async fn read_port_line(child: &mut Child, bound: Duration) -> Result<u16, SpawnError> {
    use tokio::io::AsyncBufReadExt;

    let stdout = child.stdout.take().expect("worker spawned with piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let read = timeout(bound, lines.next_line());
    let line = match read.await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            let stderr = drain_stderr(child).await;
            return Err(SpawnError::ExitedBeforeConnect { stderr });
        }
        Ok(Err(err)) => return Err(SpawnError::Io(err)),
        Err(_elapsed) => return Err(SpawnError::ConnectTimeout),
    };

    line.trim()
        .parse::<u16>()
        .map_err(|_| SpawnError::BadPortLine(line))
}

async fn drain_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = stderr.read_to_string(&mut buf).await;
    buf
}

fn apply_low_latency_options(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(err) = sock.set_nodelay(true) {
        warn!(%err, "failed to disable Nagle's algorithm");
    }
    #[cfg(target_os = "linux")]
    if let Err(err) = sock.set_quickack(true) {
        warn!(%err, "failed to enable TCP_QUICKACK");
    }
}

impl Worker {
    /// Launch a worker process and connect to it.
    ///
    /// Fails if the process exits before printing a readable port line, if
    /// that line is not a valid port number, or if the handshake does not
    /// complete within `config.connect_timeout`.
    pub async fn spawn(config: WorkerConfig) -> Result<Self, SpawnError> {
        let mut command = Command::new(&config.exe);
        command
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(SpawnError::Io)?;
        let pid = child.id().unwrap_or_default();
        let span = tracing::info_span!("worker", pid, exe = %config.exe.display());
        let _entered = span.enter();

        let port = match read_port_line(&mut child, config.connect_timeout).await {
            Ok(port) => port,
            Err(err) => {
                let _ = child.start_kill();
                return Err(err);
            }
        };

        let remaining = config.connect_timeout;
        let stream = match timeout(remaining, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(SpawnError::Connect(err));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(SpawnError::ConnectTimeout);
            }
        };
        apply_low_latency_options(&stream);
        info!(port, "connected to worker");

        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(WaitMap::new());
        let running = Arc::new(AtomicBool::new(true));

        let cancel = CancellationToken::new();

        drop(_entered);
        let inner = Arc::new(Inner {
            child: AsyncMutex::new(child),
            pid,
            writer: AsyncMutex::new(FrameWriter::new(write_half)),
            next_id: AtomicU64::new(1),
            pending: pending.clone(),
            running: running.clone(),
            span: span.clone(),
            cancel: cancel.clone(),
        });

        spawn_receive_task(read_half, pending, running, Arc::downgrade(&inner), cancel, span);

        Ok(Worker { inner })
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Query the OS process state directly.
    pub async fn is_running(&self) -> bool {
        if !self.inner.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.inner.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn write_frame(&self, kind: WireKind, id: u64, body: &[u8]) -> Result<(), CallError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TerminatedWorker.into());
        }
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_frame(kind.into(), id, body)
            .await
            .map_err(CallError::Io)
    }

    /// `async call`: issue the request and return a future of its result
    /// without waiting for it here. The request is already in flight (id
    /// allocated, sink installed, frame flushed) by the time this method
    /// returns — awaiting the returned handle only waits for the reply.
    pub fn call<T>(
        &self,
        function: &str,
        args: impl Serialize,
    ) -> Result<tokio::task::JoinHandle<Result<T, CallError>>, CallError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TerminatedWorker.into());
        }
        let body = encode_call(function, &args, false)?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
            // Install the sink before writing, so a reply can never arrive
            // before its sink exists (§5 ordering rule (a)).
            let wait = inner.pending.wait(id);
            let mut wait = std::pin::pin!(wait);
            wait.as_mut().enqueue().await.map_err(|_| CallError::Closed)?;

            {
                let mut writer = inner.writer.lock().await;
                writer
                    .write_frame(WireKind::CallWithReply.into(), id, &body)
                    .await
                    .map_err(CallError::Io)?;
            }

            let result = wait.await.map_err(|_| CallError::Closed)?;
            decode_worker_result(result)
        }))
    }

    /// `fetch`: block until the reply arrives, returning its value or the
    /// remote failure.
    pub async fn fetch<T>(&self, function: &str, args: impl Serialize) -> Result<T, CallError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let handle = self.call::<T>(function, args)?;
        handle.await.map_err(|_| CallError::Closed)?
    }

    /// `wait`: block until done, discarding the value (the worker still
    /// runs the call and a raised value still surfaces as an error).
    pub async fn wait_call(&self, function: &str, args: impl Serialize) -> Result<(), CallError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TerminatedWorker.into());
        }
        let body = encode_call(function, &args, true)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let wait = self.inner.pending.wait(id);
        let mut wait = std::pin::pin!(wait);
        wait.as_mut().enqueue().await.map_err(|_| CallError::Closed)?;
        self.write_frame(WireKind::CallWithReply, id, &body).await?;
        let result = wait.await.map_err(|_| CallError::Closed)?;
        decode_worker_result::<()>(result)
    }

    /// `do`: fire and forget, no completion signal.
    pub async fn do_call(&self, function: &str, args: impl Serialize) -> Result<(), CallError> {
        let body = encode_call(function, &args, true)?;
        self.write_frame(WireKind::CallNoReply, 0, &body).await
    }

    /// If the process is running, ask it to terminate itself cleanly.
    /// Returns whether a stop was *issued*, not whether it succeeded.
    pub async fn stop(&self) -> bool {
        if !self.is_running().await {
            return false;
        }
        self.do_call(control_ops::TERMINATE, ()).await.is_ok()
    }

    /// Deliver an OS terminate signal (SIGTERM on POSIX, the closest
    /// platform equivalent elsewhere).
    pub async fn kill(&self) -> Result<(), CallError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill as send_signal, Signal};
            use nix::unistd::Pid;
            send_signal(Pid::from_raw(self.inner.pid as i32), Signal::SIGTERM)
                .map_err(|err| CallError::Io(std::io::Error::from(err)))
        }
        #[cfg(not(unix))]
        {
            let mut child = self.inner.child.lock().await;
            child.start_kill().map_err(CallError::Io)
        }
    }

    /// Cancel the latest running call. On POSIX this delivers SIGINT
    /// directly to the child; everywhere else (where signals cannot be
    /// routed to a child independently of the parent) it sends a wire-level
    /// interrupt frame the worker translates into the same cancellation.
    pub async fn interrupt(&self) -> Result<(), CallError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill as send_signal, Signal};
            use nix::unistd::Pid;
            send_signal(Pid::from_raw(self.inner.pid as i32), Signal::SIGINT)
                .map_err(|err| CallError::Io(std::io::Error::from(err)))
        }
        #[cfg(not(unix))]
        {
            self.write_frame(WireKind::Interrupt, 0, &[]).await
        }
    }

    /// Poll `is_running` until it is false or `timeout` elapses.
    pub async fn wait_for_exit(&self, bound: Duration) -> Result<(), WaitForExitTimeout> {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            if !self.is_running().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitForExitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// `Stop`, then wait out the configured grace period, then `Kill` if
    /// the process is still running. A convenience composition of the
    /// three lifecycle primitives above; does not change their semantics.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop().await;
        if self.wait_for_exit(grace).await.is_err() {
            let _ = self.kill().await;
        }
    }
}

/// Holds only a `Weak<Inner>`: the receive task must never itself keep
/// `Inner` alive, or dropping every `Worker` handle would never unblock the
/// read it is parked on and the child process would never be killed.
fn spawn_receive_task(
    read_half: OwnedReadHalf,
    pending: Arc<WaitMap<u64, WorkerResult>>,
    running: Arc<AtomicBool>,
    inner: Weak<Inner>,
    cancel: CancellationToken,
    span: Span,
) {
    tokio::spawn(async move {
        let _entered = span.enter();
        let mut reader = FrameReader::new(read_half);
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("last worker handle dropped, stopping receive task");
                    break;
                }
                outcome = reader.read_frame() => match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(%err, "transport error reading from worker");
                        break;
                    }
                },
            };

            let (kind, id, body) = match outcome {
                ReadOutcome::Frame { kind, id, body } => (kind, id, body),
                ReadOutcome::Closed => {
                    debug!("worker closed the connection");
                    break;
                }
            };

            let Ok(wire_kind) = WireKind::try_from(kind) else {
                warn!(kind, id, "worker sent an unrecognized frame kind, dropping");
                continue;
            };

            let result = match wire_kind {
                WireKind::Result => WorkerResult::Ok(body),
                WireKind::Failure => match postcard::from_bytes::<RemoteError>(&body) {
                    Ok(err) => WorkerResult::Raise(err),
                    Err(decode_err) => {
                        WorkerResult::Raise(RemoteError::Serialization(decode_err.to_string()))
                    }
                },
                other => {
                    warn!(?other, id, "worker sent a request-shaped frame, dropping");
                    continue;
                }
            };

            match pending.wake(&id, result) {
                WakeOutcome::Woke => {}
                WakeOutcome::NoMatch(_) => {
                    warn!(id, "reply for an unknown (or already-delivered) id, dropping");
                }
                WakeOutcome::Closed(_) => {
                    debug!("pending map closed, stopping receive task");
                    break;
                }
            }
        }

        running.store(false, Ordering::SeqCst);
        pending.close();

        // If `inner` no longer upgrades, the last `Worker` handle is already
        // gone and `Drop for Inner` already killed the child; nothing left
        // to do here.
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tokio::time::sleep(TRANSPORT_FAILURE_GRACE).await;
        let mut child = inner.child.lock().await;
        if matches!(child.try_wait(), Ok(None)) {
            warn!("worker still alive after the connection closed, force-killing it");
            let _ = child.start_kill();
        }
    });
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.start_kill();
        }
    }
}
