//! Worker-side storage and RPC bindings for `RemoteChannel`.
//!
//! This is the process-wide registry described in the source's "Global
//! registries" note: a map from `channel_id` to a bounded FIFO, initialized
//! lazily the first time a channel is created and resident for the life of
//! the process (dropping a `RemoteChannel` handle on the manager side does
//! not evict the entry here — see `channel_close` for the explicit opt-in).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sandbox_protocol::{ChannelIdArg, ChannelNewArgs, ChannelPutArgs, RemoteError};
use tokio::sync::Notify;

use crate::registry::FunctionTable;

struct ChannelEntry {
    capacity: usize,
    queue: Mutex<VecDeque<Vec<u8>>>,
    not_empty: Notify,
    not_full: Notify,
}

impl ChannelEntry {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<u64, std::sync::Arc<ChannelEntry>>>,
}

fn decode_err(what: &str, err: postcard::Error) -> RemoteError {
    RemoteError::BadArguments(format!("{what}: {err}"))
}

impl ChannelRegistry {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    fn entry(&self, channel_id: u64) -> Result<std::sync::Arc<ChannelEntry>, RemoteError> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| RemoteError::Raised(format!("no such channel: {channel_id}")))
    }

    pub fn create(&self, channel_id: u64, capacity: usize) {
        self.channels
            .lock()
            .unwrap()
            .insert(channel_id, std::sync::Arc::new(ChannelEntry::new(capacity)));
    }

    pub fn close(&self, channel_id: u64) {
        self.channels.lock().unwrap().remove(&channel_id);
    }

    pub async fn put(&self, channel_id: u64, value: Vec<u8>) -> Result<(), RemoteError> {
        let entry = self.entry(channel_id)?;
        loop {
            {
                let mut queue = entry.queue.lock().unwrap();
                if queue.len() < entry.capacity {
                    queue.push_back(value);
                    entry.not_empty.notify_one();
                    return Ok(());
                }
            }
            entry.not_full.notified().await;
        }
    }

    pub async fn take(&self, channel_id: u64) -> Result<Vec<u8>, RemoteError> {
        let entry = self.entry(channel_id)?;
        loop {
            {
                let mut queue = entry.queue.lock().unwrap();
                if let Some(value) = queue.pop_front() {
                    entry.not_full.notify_one();
                    return Ok(value);
                }
            }
            entry.not_empty.notified().await;
        }
    }

    pub fn ready(&self, channel_id: u64) -> Result<bool, RemoteError> {
        let entry = self.entry(channel_id)?;
        let is_empty = entry.queue.lock().unwrap().is_empty();
        Ok(!is_empty)
    }

    /// Block until the channel has at least one value queued, without
    /// consuming it.
    pub async fn wait(&self, channel_id: u64) -> Result<(), RemoteError> {
        let entry = self.entry(channel_id)?;
        loop {
            if !entry.queue.lock().unwrap().is_empty() {
                return Ok(());
            }
            entry.not_empty.notified().await;
        }
    }
}

/// Register the `sandbox.channel.*` functions against a function table, bound
/// to a shared [`ChannelRegistry`].
pub fn install(table: &mut FunctionTable, registry: std::sync::Arc<ChannelRegistry>) {
    use sandbox_protocol::channel_ops;

    {
        let registry = registry.clone();
        table.register_sync(channel_ops::NEW, move |args| {
            let req: ChannelNewArgs =
                postcard::from_bytes(&args).map_err(|e| decode_err("channel.new", e))?;
            registry.create(req.channel_id, req.capacity);
            postcard::to_stdvec(&()).map_err(|e| decode_err("channel.new reply", e))
        });
    }

    {
        let registry = registry.clone();
        table.register(channel_ops::PUT, move |args| {
            let registry = registry.clone();
            Box::pin(async move {
                let req: ChannelPutArgs =
                    postcard::from_bytes(&args).map_err(|e| decode_err("channel.put", e))?;
                registry.put(req.channel_id, req.value).await?;
                postcard::to_stdvec(&()).map_err(|e| decode_err("channel.put reply", e))
            })
        });
    }

    {
        let registry = registry.clone();
        table.register(channel_ops::TAKE, move |args| {
            let registry = registry.clone();
            Box::pin(async move {
                let req: ChannelIdArg =
                    postcard::from_bytes(&args).map_err(|e| decode_err("channel.take", e))?;
                let value = registry.take(req.channel_id).await?;
                postcard::to_stdvec(&value).map_err(|e| decode_err("channel.take reply", e))
            })
        });
    }

    {
        let registry = registry.clone();
        table.register_sync(channel_ops::READY, move |args| {
            let req: ChannelIdArg =
                postcard::from_bytes(&args).map_err(|e| decode_err("channel.ready", e))?;
            let ready = registry.ready(req.channel_id)?;
            postcard::to_stdvec(&ready).map_err(|e| decode_err("channel.ready reply", e))
        });
    }

    {
        let registry = registry.clone();
        table.register(channel_ops::WAIT, move |args| {
            let registry = registry.clone();
            Box::pin(async move {
                let req: ChannelIdArg =
                    postcard::from_bytes(&args).map_err(|e| decode_err("channel.wait", e))?;
                registry.wait(req.channel_id).await?;
                postcard::to_stdvec(&()).map_err(|e| decode_err("channel.wait reply", e))
            })
        });
    }

    table.register_sync(channel_ops::CLOSE, move |args| {
        let req: ChannelIdArg =
            postcard::from_bytes(&args).map_err(|e| decode_err("channel.close", e))?;
        registry.close(req.channel_id);
        postcard::to_stdvec(&()).map_err(|e| decode_err("channel.close reply", e))
    });
}
