//! Demo/test scaffolding: spawns a small pool of workers and drives them
//! with the registered demo functions. Not part of the core API — a real
//! embedder depends on `sandbox-manager` directly.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sandbox_manager::{Worker, WorkerConfig};
use tracing::info;

/// Spawn one or more sandbox-worker processes and exercise them.
#[derive(Debug, Parser)]
struct Args {
    /// Path to the sandbox-worker executable.
    #[arg(long, default_value = "sandbox-worker")]
    exe: PathBuf,

    /// Number of workers to spawn.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Run the registered `sandbox.add` demo call on each worker before
    /// shutting it down.
    #[arg(long)]
    eval_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut workers = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let worker = Worker::spawn(WorkerConfig::new(&args.exe))
            .await
            .map_err(|err| anyhow::anyhow!("failed to spawn worker {i}: {err}"))?;
        info!(pid = worker.pid(), "spawned worker {i}");
        workers.push(worker);
    }

    if args.eval_demo {
        for (i, worker) in workers.iter().enumerate() {
            let sum: i64 = worker.fetch("sandbox.add", (i as i64, 100_i64)).await?;
            info!(i, sum, "sandbox.add replied");
        }
    }

    for worker in &workers {
        worker.shutdown(Duration::from_secs(5)).await;
    }

    Ok(())
}
