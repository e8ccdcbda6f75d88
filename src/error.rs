//! Error types for the protocol core.
//!
//! Per-send failures resolve the corresponding queue entry's future; they never
//! panic and never tear down the session by themselves. Stream-level failures
//! (malformed frames, lockstep mismatches, stale firmware) are logged and
//! reported as events rather than propagated, matching existing firmware's
//! tolerant behavior.

use thiserror::Error;

use crate::proto::routing::ErrorReason;

/// Maximum outbound payload length accepted by [`crate::queue::TransmitQueue::enqueue`].
pub const MAX_PAYLOAD_LEN: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("outbound payload of {len} bytes exceeds the {max}-byte frame budget")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("transmit queue is at capacity ({capacity} entries)")]
    QueueFull { capacity: usize },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("radio reported a routing error: {0:?}")]
    RoutingError(ErrorReason),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("configuration lockstep mismatch: expected {expected:#010x}, got {got:#010x}")]
    ConfigLockstepMismatch { expected: u32, got: u32 },

    #[error("firmware version {reported} is below the minimum supported version {minimum}")]
    FirmwareTooOld { reported: u32, minimum: u32 },

    #[error("CSPRNG unavailable or returned zero")]
    RandomnessUnavailable,

    #[error("pending send was cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;
