//! Storage backends for the forest's hash slots.
//!
//! A backend holds `(2 << rows) - 1` fixed 32-byte hash slots addressed by
//! node position and supports reading and writing single slots, swapping
//! slots and equal-length disjoint ranges, querying the slot count, and
//! growing it. Reads of never-written slots return the `EMPTY` digest. All
//! calls are sequenced by the single-threaded forest engine; no backend
//! provides any concurrency safety of its own.
//!
//! Four backends implement the contract:
//!
//! - [MemStore]: a contiguous in-memory vector. Fastest, and the only
//!   backend that can be dumped verbatim for later restoration.
//! - [DiskStore]: a flat blob, slot `p` at bytes `[32p, 32p+32)`.
//! - [CachedStore]: the same blob layout with the top rows of the tree
//!   (the hashes rewritten by every modification) held in memory.
//! - [CowStore]: a chunked, log-structured layout that keeps dirty chunks in
//!   memory up to a byte budget and never overwrites a chunk in place. Its
//!   on-disk format is distinct from the flat-blob backends.
//!
//! The first three backends share the flat 32-byte-slot file layout, so a
//! forest written by one can be reopened with another.

mod cached;
mod cow;
mod disk;
mod memory;

pub use cached::{CachedStore, Config as CachedConfig};
pub use cow::{Config as CowConfig, CowStore};
pub use disk::{Config as DiskConfig, DiskStore};
pub use memory::MemStore;

use commonware_cryptography::sha256::Digest;
use commonware_runtime::{Metrics, Storage as RStorage};
use thiserror::Error;

/// Size of one hash slot in bytes.
pub(crate) const SLOT_SIZE: u64 = 32;

/// Errors that can occur when interacting with a backend.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("position {pos} out of bounds (size {size})")]
    OutOfBounds { pos: u64, size: u64 },
    #[error("backends cannot shrink ({from} -> {to} slots)")]
    Shrink { from: u64, to: u64 },
    #[error("chunk index corrupt")]
    CorruptChunkIndex,
}

/// Configuration selecting and parameterizing a backend.
#[derive(Clone)]
pub enum Config {
    Mem,
    Disk(DiskConfig),
    Cached(CachedConfig),
    Cow(CowConfig),
}

/// A forest storage backend.
///
/// Dispatch is a tagged variant rather than a trait object: it is crossed at
/// most O(log N) times per modification and keeps the forest a single type
/// across all restore modes.
pub enum Store<E: RStorage + Metrics> {
    Mem(MemStore),
    Disk(DiskStore<E>),
    Cached(CachedStore<E>),
    Cow(CowStore<E>),
}

impl<E: RStorage + Metrics> Store<E> {
    /// Open the backend selected by `cfg`.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        match cfg {
            Config::Mem => Ok(Self::Mem(MemStore::new())),
            Config::Disk(cfg) => Ok(Self::Disk(DiskStore::init(context, cfg).await?)),
            Config::Cached(cfg) => Ok(Self::Cached(CachedStore::init(context, cfg).await?)),
            Config::Cow(cfg) => Ok(Self::Cow(CowStore::init(context, cfg).await?)),
        }
    }

    /// Name of the backend variant (for diagnostics).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mem(_) => "mem",
            Self::Disk(_) => "disk",
            Self::Cached(_) => "cached",
            Self::Cow(_) => "cow",
        }
    }

    pub(crate) fn as_mem(&self) -> Option<&MemStore> {
        match self {
            Self::Mem(store) => Some(store),
            _ => None,
        }
    }

    /// Number of hash slots currently allocated.
    pub fn size(&self) -> u64 {
        match self {
            Self::Mem(store) => store.size(),
            Self::Disk(store) => store.size(),
            Self::Cached(store) => store.size(),
            Self::Cow(store) => store.size(),
        }
    }

    /// Read the hash at `pos`, or `EMPTY` if it was never written.
    ///
    /// Takes `&mut self` because the cached backend claims cache slots on
    /// read misses.
    pub async fn read(&mut self, pos: u64) -> Result<Digest, Error> {
        match self {
            Self::Mem(store) => store.read(pos),
            Self::Disk(store) => store.read(pos).await,
            Self::Cached(store) => store.read(pos).await,
            Self::Cow(store) => store.read(pos).await,
        }
    }

    /// Write `digest` at `pos`.
    pub async fn write(&mut self, pos: u64, digest: &Digest) -> Result<(), Error> {
        match self {
            Self::Mem(store) => store.write(pos, digest),
            Self::Disk(store) => store.write(pos, digest).await,
            Self::Cached(store) => store.write(pos, digest).await,
            Self::Cow(store) => store.write(pos, digest).await,
        }
    }

    /// Swap the hashes at `a` and `b`.
    pub async fn swap(&mut self, a: u64, b: u64) -> Result<(), Error> {
        match self {
            Self::Mem(store) => store.swap(a, b),
            Self::Disk(store) => store.swap(a, b).await,
            Self::Cached(store) => store.swap(a, b).await,
            Self::Cow(store) => store.swap(a, b).await,
        }
    }

    /// Swap the `width` consecutive hashes starting at `a` with those starting
    /// at `b`. The ranges must be disjoint.
    pub async fn swap_range(&mut self, a: u64, b: u64, width: u64) -> Result<(), Error> {
        assert!(a + width <= b || b + width <= a, "overlapping swap ranges");
        match self {
            Self::Mem(store) => store.swap_range(a, b, width),
            Self::Disk(store) => store.swap_range(a, b, width).await,
            Self::Cached(store) => store.swap_range(a, b, width).await,
            Self::Cow(store) => store.swap_range(a, b, width).await,
        }
    }

    /// Grow the backend to exactly `slots` slots. Newly created slots read as
    /// `EMPTY`.
    pub async fn resize(&mut self, slots: u64) -> Result<(), Error> {
        match self {
            Self::Mem(store) => store.resize(slots),
            Self::Disk(store) => store.resize(slots).await,
            Self::Cached(store) => store.resize(slots).await,
            Self::Cow(store) => store.resize(slots).await,
        }
    }

    /// Flush pending writes to the underlying storage.
    pub async fn sync(&mut self) -> Result<(), Error> {
        match self {
            Self::Mem(_) => Ok(()),
            Self::Disk(store) => store.sync().await,
            Self::Cached(store) => store.sync().await,
            Self::Cow(store) => store.sync().await,
        }
    }

    /// Flush and release the backend.
    pub async fn close(self) -> Result<(), Error> {
        match self {
            Self::Mem(_) => Ok(()),
            Self::Disk(store) => store.close().await,
            Self::Cached(store) => store.close().await,
            Self::Cow(store) => store.close().await,
        }
    }
}
