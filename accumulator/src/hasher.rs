//! Hashing primitives for the forest.
//!
//! A parent commits to its children with a single-round SHA-256 over the
//! 64-byte concatenation of their digests. The all-zero digest is reserved as
//! the `EMPTY` sentinel: it marks a slot that was never written or whose
//! subtree no longer holds any live leaves, and is rejected as a leaf value
//! on insertion.

use commonware_cryptography::{sha256::Digest, Hasher, Sha256};

/// Byte length of the MiniHash prefix used to key the position map.
pub const MINI_LENGTH: usize = 8;

/// The all-zero digest.
pub fn empty() -> Digest {
    Digest::from([0u8; 32])
}

/// Whether `digest` is the `EMPTY` sentinel.
pub fn is_empty(digest: &Digest) -> bool {
    digest.as_ref().iter().all(|b| *b == 0)
}

/// The MiniHash of `digest`: its first [MINI_LENGTH] bytes, used as the
/// compact key of the position map. Collisions within a single forest are
/// expected to be negligible, and lookups tolerate them by reading the
/// candidate slots back.
pub fn mini(digest: &Digest) -> [u8; MINI_LENGTH] {
    let mut out = [0u8; MINI_LENGTH];
    out.copy_from_slice(&digest.as_ref()[..MINI_LENGTH]);
    out
}

/// Hash of a parent node over its two children.
pub fn parent_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_ref());
    hasher.update(right.as_ref());
    hasher.finalize()
}

/// Collapsed value of a pair: `EMPTY` if both members are `EMPTY`, the
/// surviving member if exactly one is (a promotion, no hashing), and
/// [parent_hash] otherwise.
pub fn merge(left: &Digest, right: &Digest) -> Digest {
    if is_empty(left) {
        return right.clone();
    }
    if is_empty(right) {
        return left.clone();
    }
    parent_hash(left, right)
}
