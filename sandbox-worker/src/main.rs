//! Worker process entry point.
//!
//! On startup the worker picks a TCP listening port, writes it to standard
//! output as the handshake line the manager reads, accepts exactly one
//! connection, then runs the dispatch loop on it until the connection
//! closes. Everything written to standard output after the handshake line
//! belongs to the manager's framing, not to humans — all worker logging
//! goes to standard error.

mod channels;
mod dispatch;
mod registry;

use std::io::Write as _;
use std::process;
use std::sync::Arc;

use sandbox_wire::FrameWriter;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::channels::ChannelRegistry;
use crate::dispatch::InterruptTarget;
use crate::registry::FunctionTable;

/// Lowest port in the deterministic hint range; see [`pick_port_hint`].
const PORT_BASE: u16 = 9000;
const PORT_RANGE: u16 = 1000;

fn pick_port_hint() -> u16 {
    PORT_BASE + (process::id() % u32::from(PORT_RANGE)) as u16
}

/// Bind a listener on the deterministic hint port, falling back to any free
/// port if the hint is already taken.
async fn bind_listener() -> std::io::Result<TcpListener> {
    let hint = pick_port_hint();
    match TcpListener::bind(("127.0.0.1", hint)).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!(hint, %err, "hinted port unavailable, asking the OS for any free port");
            TcpListener::bind(("127.0.0.1", 0)).await
        }
    }
}

/// Print the handshake line and accept the manager's single connection.
///
/// Nothing may be written to standard output before this line; the manager
/// reads exactly one line of decimal digits.
async fn handshake(listener: &TcpListener) -> std::io::Result<TcpStream> {
    let port = listener.local_addr()?.port();
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{port}")?;
        stdout.flush()?;
    }
    let (stream, peer) = listener.accept().await?;
    apply_low_latency_options(&stream);
    info!(%peer, port, "accepted the manager's connection");
    Ok(stream)
}

/// Disable Nagle and enable TCP_QUICKACK (Linux) on a freshly accepted
/// connection. `SockRef` borrows the stream's file descriptor without
/// taking ownership, so this works alongside tokio's own handle.
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

fn install_demo_functions(table: &mut FunctionTable) {
    table.register_sync("sandbox.identity", |args| Ok(args));
    table.register_sync("sandbox.add", |args| {
        let (a, b): (i64, i64) = postcard::from_bytes(&args)
            .map_err(|e| sandbox_protocol::RemoteError::BadArguments(e.to_string()))?;
        postcard::to_stdvec(&(a + b))
            .map_err(|e| sandbox_protocol::RemoteError::Serialization(e.to_string()))
    });
    // Never returns on its own; exists so callers can exercise Interrupt
    // against a call that is genuinely still running.
    table.register("demo.sleep_forever", |_args| {
        Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            postcard::to_stdvec(&())
                .map_err(|e| sandbox_protocol::RemoteError::Serialization(e.to_string()))
        })
    });
}

/// Registered so a manager's `Stop` can ask the worker to exit cleanly
/// instead of being killed outright.
fn install_control_functions(table: &mut FunctionTable) {
    table.register_sync(sandbox_protocol::control_ops::TERMINATE, |_args| {
        info!("terminate requested, exiting");
        process::exit(0);
    });
}

/// On Unix, the worker disables the default SIGINT-terminates-process
/// behavior and instead routes SIGINT into the same interrupt target the
/// wire-level `0x14` frame uses, matching §4.2's "disables exit-on-interrupt"
/// requirement. Non-POSIX targets never receive a process-level SIGINT from
/// the manager (see `sandbox-manager`'s `Interrupt`), so there is nothing to
/// install there.
#[cfg(unix)]
fn spawn_sigint_bridge(
    interrupts: Arc<InterruptTarget>,
    writer: Arc<AsyncMutex<FrameWriter<OwnedWriteHalf>>>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stream = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, "failed to install a SIGINT handler");
            return;
        }
    };
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            info!("received SIGINT, interrupting the latest call");
            if let Some(id) = interrupts.fire() {
                dispatch::reply_failure(&writer, id, &sandbox_protocol::RemoteError::Interrupted)
                    .await;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_sigint_bridge(
    _interrupts: Arc<InterruptTarget>,
    _writer: Arc<AsyncMutex<FrameWriter<OwnedWriteHalf>>>,
) {
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = match bind_listener().await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind a listening port: {err}");
            process::exit(1);
        }
    };

    let stream = match handshake(&listener).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("failed to accept the manager's connection: {err}");
            process::exit(1);
        }
    };

    let mut table = FunctionTable::new();
    install_demo_functions(&mut table);
    install_control_functions(&mut table);
    channels::install(&mut table, ChannelRegistry::new());
    let table = std::sync::Arc::new(table);

    let interrupts = InterruptTarget::new();
    let (read_half, write_half) = stream.into_split();
    let writer = dispatch::new_writer(write_half);
    spawn_sigint_bridge(interrupts.clone(), writer.clone());

    dispatch::run(read_half, writer, table, interrupts).await;

    info!("connection closed, exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_hint_stays_in_range() {
        let hint = pick_port_hint();
        assert!((PORT_BASE..PORT_BASE + PORT_RANGE).contains(&hint));
    }
}
