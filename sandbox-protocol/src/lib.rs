//! Payload shapes carried inside `sandbox-wire` frame bodies.
//!
//! The original (dynamically-typed) protocol this is modeled on lets a call
//! carry an arbitrary serialized callable. A statically-typed target can't
//! do that, so a call instead names a [`FunctionId`] resolved against a
//! registry the worker builds at startup (see `sandbox-worker`); the rest of
//! the protocol — framing, correlation, interrupt, channels — is unchanged.

use serde::{Deserialize, Serialize};

mod hash;

/// The five byte values that ever appear as a [`sandbox_wire`] frame `kind`.
///
/// `0x64` (serialization failure) is deliberately not a member of this
/// enum: it is a synthetic kind the manager's receive task assigns in
/// memory when a frame's body fails to decode, and it is never written to
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireKind {
    CallWithReply = 0x01,
    CallNoReply = 0x02,
    Interrupt = 0x14,
    Result = 0x50,
    Failure = 0x51,
}

/// The synthetic kind the manager assigns, in memory only, when a frame's
/// body could not be decoded into the type its `kind` byte promised.
pub const SERIALIZATION_FAILURE_KIND: u8 = 0x64;

#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid wire frame kind")]
pub struct UnknownWireKind(pub u8);

impl TryFrom<u8> for WireKind {
    type Error = UnknownWireKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(WireKind::CallWithReply),
            0x02 => Ok(WireKind::CallNoReply),
            0x14 => Ok(WireKind::Interrupt),
            0x50 => Ok(WireKind::Result),
            0x51 => Ok(WireKind::Failure),
            other => Err(UnknownWireKind(other)),
        }
    }
}

impl From<WireKind> for u8 {
    fn from(value: WireKind) -> Self {
        value as u8
    }
}

/// The id of a function registered on the worker, addressed by name.
///
/// Two `FunctionId`s computed from the same name are always equal; this is
/// the only property callers may rely on (there is no defined mapping back
/// from an id to its name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId([u8; 8]);

impl FunctionId {
    pub fn for_name(name: &str) -> Self {
        let mut hasher = hash::Fnv1a64::new();
        hasher.update(name.as_bytes());
        FunctionId(hasher.finish_le_bytes())
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn:")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Body of a `call-with-reply` (kind `0x01`) or `call-no-reply` (kind
/// `0x02`) frame.
///
/// For `call-no-reply`, `discard_result` is ignored by the receiver (there
/// is nowhere to send a result either way); it is kept in the shape so both
/// kinds share one payload type, matching §3 of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallBody {
    pub function: FunctionId,
    /// Function-specific argument bytes, postcard-encoded by the caller and
    /// decoded by whatever handler is registered under `function`.
    pub args: Vec<u8>,
    pub discard_result: bool,
}

/// Body of an `interrupt` (kind `0x14`) frame: always empty.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterruptBody;

/// The error shapes a remote call can fail with.
///
/// A `Failure` (kind `0x51`) frame body is always a postcard-encoded
/// `RemoteError`. A `Result` (kind `0x50`) frame body is never wrapped in
/// this type: it is the raw, function-specific response bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("no function registered with this id")]
    UnknownFunction,
    #[error("argument deserialization failed: {0}")]
    BadArguments(String),
    #[error("call failed: {0}")]
    Raised(String),
    #[error("call was interrupted")]
    Interrupted,
    #[error("frame body failed to deserialize: {0}")]
    Serialization(String),
}

/// The function a worker registers so the manager's `Stop` can ask it to
/// exit cleanly rather than being killed.
pub mod control_ops {
    pub const TERMINATE: &str = "sandbox.control.terminate";
}

/// Names and payloads for the handful of functions every worker registers
/// to implement [`RemoteChannel`](../sandbox_manager/struct.RemoteChannel.html)
/// operations. Kept as plain string constants (not an enum) since they are
/// resolved through the same [`FunctionId::for_name`] path as any
/// application-registered function.
pub mod channel_ops {
    pub const NEW: &str = "sandbox.channel.new";
    pub const PUT: &str = "sandbox.channel.put";
    pub const TAKE: &str = "sandbox.channel.take";
    pub const READY: &str = "sandbox.channel.ready";
    pub const WAIT: &str = "sandbox.channel.wait";
    pub const CLOSE: &str = "sandbox.channel.close";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelNewArgs {
    pub channel_id: u64,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPutArgs {
    pub channel_id: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelIdArg {
    pub channel_id: u64,
}
