//! Flat-file store for per-block membership proofs with in-place TTL
//! back-patching.
//!
//! # Format
//!
//! Two blobs within a caller-provided `partition`. The offset blob is a
//! dense array of 8-byte big-endian offsets, one per block height; entry `h`
//! locates the record for block `h` inside the proof blob. The proof blob is
//! a sequence of framed records:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+--   --+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | ...   |
//! +---+---+---+---+---+---+---+---+---+--   --+
//! |     Magic     |  Size (u32)   |  Payload   |
//! +---+---+---+---+---+---+---+---+---+--   --+
//!
//! Magic = 0xaa 0xff 0xaa 0xff
//! ```
//!
//! The payload carries, at a fixed configured offset, a region of zeroed
//! 4-byte big-endian TTL slots. When a block later spends one of the
//! payload's outputs, the slot is overwritten in place with the output's
//! lifespan in blocks. A slot reading zero is simply not yet spent.
//!
//! # Writers
//!
//! Exactly two single-writer tasks cooperate on the proof blob (see
//! [FlatFile]): the proof task is its sole appender and the TTL task its
//! sole in-place patcher. The TTL task only touches slots inside records
//! whose offsets the proof task has already published, so the two never
//! collide; the offset handoff is the ordering edge. Proofs are persisted in
//! strict block-height order.
//!
//! # Restart
//!
//! On startup the offset blob is replayed (its length fixes the resume
//! height) and the final record's frame is checked against the proof blob's
//! length. There is no torn-write recovery: a tail mismatch fails startup
//! rather than guessing at a boundary.

mod reader;
mod storage;

pub use reader::Reader;
pub use storage::{FlatFile, TtlBlock, TtlEntry};

use thiserror::Error;

/// Leading bytes of every proof record.
pub const MAGIC: [u8; 4] = [0xaa, 0xff, 0xaa, 0xff];

/// Bytes of framing (magic + size) before a record's payload.
pub const HEADER_SIZE: u64 = 8;

/// Records at least this long are rejected as corrupt before any allocation.
pub const MAX_PAYLOAD: u32 = 1 << 24;

pub(crate) const PROOF_BLOB: &[u8] = b"proofs";
pub(crate) const OFFSET_BLOB: &[u8] = b"offsets";

/// Errors that can occur when interacting with the flat-file store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("offset blob size {0} not a multiple of 8")]
    CorruptOffsetFile(u64),
    #[error("proof blob tail does not match the offset index")]
    TornProofFile,
    #[error("proof for height {height} out of order (next is {next})")]
    OutOfOrder { height: u64, next: u64 },
    #[error("payload of {len} bytes cannot hold {slots} ttl slots behind a {prefix} byte prefix")]
    ShortPayload { len: usize, slots: u32, prefix: u32 },
    #[error("record length {0} exceeds maximum")]
    OversizedRecord(u32),
    #[error("bad magic in record for height {0}")]
    BadMagic(u64),
    #[error("no record for height {0}")]
    UnknownHeight(u64),
    #[error("writer stopped")]
    Stopped,
}

/// Configuration for [FlatFile] storage.
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition holding the proof and
    /// offset blobs.
    pub partition: String,

    /// Payload bytes preceding the TTL slot region in every record. Fixed by
    /// the upstream proof serialization.
    pub ttl_prefix: u32,

    /// Capacity of the proof append queue.
    pub proof_backlog: usize,

    /// Capacity of the TTL result queue.
    pub ttl_backlog: usize,

    /// How many published record offsets the TTL task may lag behind before
    /// the proof task blocks.
    pub offset_backlog: usize,
}
