//! The forest: a dynamic hash accumulator committing to a UTXO set.
//!
//! A forest is a set of perfect binary Merkle trees over 32-byte leaf
//! hashes, laid out in the slot space of one enclosing perfect tree (see
//! [crate::position]). Its commitment is the ordered tuple of root hashes,
//! at most one per row, which lightweight clients use to verify membership
//! proofs without storing the set itself.
//!
//! # Operations
//!
//! [Forest::modify] applies one block's worth of changes: deletions happen
//! first and additions append to the right. Deletion is swapless: surviving
//! leaves never move, the deleted slots become `EMPTY` holes, and the value
//! of a subtree that lost leaves collapses upward (a node with an `EMPTY`
//! sibling is promoted into its parent without hashing). Each modification
//! returns an [UndoBlock] that [Forest::undo] can apply to roll the forest
//! back one block, for reorg handling.
//!
//! [Forest::prove] produces a [Proof] for a set of live leaves;
//! [Proof::verify] checks one against a root tuple with no access to the
//! forest.
//!
//! # Persistence
//!
//! [Forest::write_misc] records the leaf cursor and row count;
//! [Forest::dump] (RAM backend only) writes the slot array verbatim in the
//! flat-blob layout; [Forest::restore] reopens a forest in any backend mode
//! and rebuilds the position map by scanning the occupied leaf slots.
//!
//! # Concurrency
//!
//! None. The forest is strictly single threaded; a failed [Forest::modify]
//! leaves the state undefined and the caller is expected to rebuild.

mod proof;
mod storage;

pub use proof::Proof;
pub use storage::Forest;

use crate::{
    hasher::{mini, MINI_LENGTH},
    store,
};
use commonware_cryptography::sha256::Digest;
use thiserror::Error;

/// Errors that can occur when interacting with a [Forest].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("cannot add the empty (all zero) leaf")]
    EmptyLeaf,
    #[error("unknown leaf: {0:?}")]
    UnknownLeaf(Digest),
    #[error("position {0} does not hold a live leaf")]
    UnknownPosition(u64),
    #[error("cannot delete {dels} leaves, only {leaves} exist")]
    ExcessiveDeletions { dels: u64, leaves: u64 },
    #[error("position {0} deleted twice")]
    DuplicateDeletion(u64),
    #[error("dirt {pos} outside forest of {leaves} leaves")]
    DirtOutOfBounds { pos: u64, leaves: u64 },
    #[error("forest can only grow one row at a time ({from} -> {to})")]
    CapacityStep { from: u8, to: u8 },
    #[error("operation requires the mem backend, forest uses {0}")]
    WrongBackend(&'static str),
    #[error("undo block does not match forest state")]
    InvalidUndo,
    #[error("misc record too small: {0} bytes")]
    CorruptMiscFile(u64),
    #[error("forest blob truncated: {size} bytes, expected {expected}")]
    TruncatedForest { size: u64, expected: u64 },
    #[error("forest sanity violated: {0}")]
    Sanity(String),

    // proof verification failures
    #[error("proof position {0} invalid")]
    InvalidProofPosition(u64),
    #[error("proof is missing sibling hashes")]
    MissingSiblings,
    #[error("proof has extra sibling hashes")]
    ExtraSiblings,
    #[error("reconstructed roots do not match")]
    RootMismatch,
}

/// One element of the accumulated set: a UTXO hash plus a hint whether
/// proofs for it should be kept warm by downstream caches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub hash: Digest,
    pub remember: bool,
}

impl Leaf {
    pub fn new(hash: Digest, remember: bool) -> Self {
        Self { hash, remember }
    }

    /// The MiniHash keying this leaf in the position map: the first
    /// [MINI_LENGTH] bytes of its hash.
    pub fn mini(&self) -> [u8; MINI_LENGTH] {
        mini(&self.hash)
    }
}

/// Configuration for a [Forest].
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition holding the misc record
    /// and, for the RAM backend, the dumped slot array. May be shared with a
    /// flat-blob store partition: the layouts are compatible, which is what
    /// allows restoring a disk forest into RAM.
    pub partition: String,

    /// Backend selection and parameters.
    pub store: store::Config,
}

/// The data required to reverse one [Forest::modify].
#[derive(Clone, Debug)]
pub struct UndoBlock {
    pub(crate) num_adds: u64,
    /// Deleted leaves with their original positions, ascending.
    pub(crate) deleted: Vec<(u64, Digest)>,
}

impl UndoBlock {
    pub fn num_adds(&self) -> u64 {
        self.num_adds
    }

    pub fn deleted(&self) -> &[(u64, Digest)] {
        &self.deleted
    }
}
