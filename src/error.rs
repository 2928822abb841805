//! Crate-wide error type.
//!
//! Every recoverable and unrecoverable failure the serving core can produce
//! is a variant of [`CoreError`]. Propagation policy (who recovers, who
//! surfaces) lives with the caller — this type only carries the fact of the
//! failure.

use thiserror::Error;

use crate::cache::block::BlockId;

#[derive(Error, Debug)]
pub enum CoreError {
    /// The arena could not satisfy an allocation. Recoverable: the
    /// scheduler retries after eviction or preemption.
    #[error("arena out of capacity")]
    OutOfCapacity,

    /// A page-table slot the caller needed to read was `Evicted` and no
    /// restore succeeded. Recoverable once, by re-prefill from the last
    /// present prefix.
    #[error("sequence {seq_id}: token position {token_pos} is evicted (KV miss)")]
    KvMiss { seq_id: u64, token_pos: usize },

    /// A kernel or pager call was given inputs whose shapes don't agree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Programmer error: bad argument, surfaced immediately.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request exceeded its wall-clock deadline.
    #[error("request exceeded its deadline")]
    Timeout,

    /// Request was cancelled by its caller.
    #[error("request cancelled")]
    Cancelled,

    /// An opaque kernel reported failure. Fails the in-flight request; the
    /// scheduler continues running other sequences.
    #[error("kernel failure: {0}")]
    KernelFailure(String),

    /// Eviction could not persist (or restore) a block to/from disk.
    /// Recoverable by discarding the block without saving it.
    #[error("persistence I/O failed: {0}")]
    PersistenceIo(#[from] std::io::Error),

    /// Arena-internal: the referenced block id doesn't exist. This signals
    /// a bookkeeping bug (dangling id) rather than a normal runtime
    /// condition, but it is still returned rather than panicking so callers
    /// at a trust boundary can choose to fail the request instead of the
    /// process.
    #[error("unknown block id {0}")]
    UnknownBlock(BlockId),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Why a request's token stream ended, surfaced to callers of `poll` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// A stop string or stop token matched.
    Stop,
    /// `max_new_tokens` was reached.
    Length,
    /// The model emitted its end-of-sequence token.
    Eos,
    /// The request was cancelled.
    Cancelled,
    /// An unrecoverable error terminated the request.
    Error,
}
