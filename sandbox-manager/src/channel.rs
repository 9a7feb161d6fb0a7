//! `RemoteChannel`: a FIFO living in the worker process, used to hand values
//! across the boundary in either direction without going through a call's
//! request/reply shape (§4.4).

use std::sync::atomic::{AtomicU64, Ordering};

use sandbox_protocol::{channel_ops, ChannelIdArg, ChannelNewArgs, ChannelPutArgs};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CallError;
use crate::worker::Worker;

/// Default queue depth for [`RemoteChannel::new`]; callers needing a
/// different bound should use [`RemoteChannel::with_capacity`].
pub const DEFAULT_CAPACITY: usize = 32;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A bounded FIFO that lives in the worker process, reachable from the
/// manager by id. Cloning a `RemoteChannel` shares the same underlying
/// queue; dropping every clone does not close it (see [`RemoteChannel::close`]).
#[derive(Clone)]
pub struct RemoteChannel {
    worker: Worker,
    channel_id: u64,
}

impl RemoteChannel {
    /// Create a channel of [`DEFAULT_CAPACITY`] in `worker`.
    pub async fn new(worker: &Worker) -> Result<Self, CallError> {
        Self::with_capacity(worker, DEFAULT_CAPACITY).await
    }

    /// Create a channel of the given bound in `worker`.
    pub async fn with_capacity(worker: &Worker, capacity: usize) -> Result<Self, CallError> {
        let channel_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst);
        worker
            .fetch::<()>(
                channel_ops::NEW,
                ChannelNewArgs {
                    channel_id,
                    capacity,
                },
            )
            .await?;
        Ok(Self {
            worker: worker.clone(),
            channel_id,
        })
    }

    /// Push a value onto the channel, blocking on the worker side while it
    /// is full.
    pub async fn put(&self, value: &impl Serialize) -> Result<(), CallError> {
        let value = postcard::to_stdvec(value).map_err(CallError::Encode)?;
        self.worker
            .fetch::<()>(
                channel_ops::PUT,
                ChannelPutArgs {
                    channel_id: self.channel_id,
                    value,
                },
            )
            .await
    }

    /// Pop the oldest value, blocking on the worker side while it is empty.
    pub async fn take<T: DeserializeOwned + Send + 'static>(&self) -> Result<T, CallError> {
        self.worker
            .fetch(channel_ops::TAKE, ChannelIdArg {
                channel_id: self.channel_id,
            })
            .await
    }

    /// Whether a value is available without consuming it.
    pub async fn ready(&self) -> Result<bool, CallError> {
        self.worker
            .fetch(channel_ops::READY, ChannelIdArg {
                channel_id: self.channel_id,
            })
            .await
    }

    /// Block until a value is available, without consuming it.
    pub async fn wait(&self) -> Result<(), CallError> {
        self.worker
            .fetch::<()>(channel_ops::WAIT, ChannelIdArg {
                channel_id: self.channel_id,
            })
            .await
    }

    /// Evict the channel's entry on the worker side. Later operations on
    /// this handle (or any clone of it) fail once the worker drops it.
    pub async fn close(&self) -> Result<(), CallError> {
        self.worker
            .fetch::<()>(channel_ops::CLOSE, ChannelIdArg {
                channel_id: self.channel_id,
            })
            .await
    }

    pub fn id(&self) -> u64 {
        self.channel_id
    }
}
