//! The error taxonomy of §7: spawn failures, a terminated worker, remote
//! failures, and the transport/serialization failures the receive task can
//! observe. Mirrors the shape of `postcard-rpc`'s `HostErr<WireErr>`.

use sandbox_protocol::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to launch the worker process: {0}")]
    Io(#[source] std::io::Error),
    #[error("worker exited before we could connect: {stderr}")]
    ExitedBeforeConnect { stderr: String },
    #[error("timed out waiting for the worker to report its port")]
    ConnectTimeout,
    #[error("worker's port handshake line was not a valid port number: {0:?}")]
    BadPortLine(String),
    #[error("failed to connect to the worker's socket: {0}")]
    Connect(#[source] std::io::Error),
}

/// An attempt to use a handle whose process has already exited.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("the worker process has already exited")]
pub struct TerminatedWorker;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Terminated(#[from] TerminatedWorker),
    #[error("socket I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to encode call arguments: {0}")]
    Encode(#[source] postcard::Error),
    #[error("failed to decode the call result: {0}")]
    Decode(#[source] postcard::Error),
    #[error("the remote call raised: {0}")]
    Remote(#[from] RemoteError),
    #[error("the worker's receive task has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("the worker did not exit within the requested grace period")]
pub struct WaitForExitTimeout;
