//! Manager-side half of the sandboxed multiprocessing runtime: spawning
//! worker processes, calling into them, and tearing them down.
//!
//! A [`Worker`] owns one child process and the single TCP connection used
//! to exchange frames with it (see `sandbox-wire` for the framing and
//! `sandbox-protocol` for the payload shapes carried inside it). Handles
//! are cheap to clone and safe to share across tasks; every call allocates
//! its own correlation id and waits on its own slot in a shared pending-
//! reply map, so unrelated calls never block each other.

mod channel;
mod config;
mod error;
mod worker;

pub use channel::{RemoteChannel, DEFAULT_CAPACITY};
pub use config::{WorkerConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_STOP_GRACE};
pub use error::{CallError, SpawnError, TerminatedWorker, WaitForExitTimeout};
pub use worker::Worker;
