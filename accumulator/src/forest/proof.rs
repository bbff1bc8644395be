//! Membership proofs for forest leaves.
//!
//! A [Proof] carries the sorted positions of the proven leaves, their
//! hashes, and the sibling hashes needed to recompute every root whose tree
//! contains a target. Siblings are packed in the re-hash traversal order
//! (row by row, ascending positions), which lets verification replay the
//! exact upward walk the prover took. An `EMPTY` sibling marks a position
//! whose subtree collapsed away; verification promotes across it without
//! hashing, just as the forest does.

use super::Error;
use crate::{
    hasher::{is_empty, merge},
    position::{self, RootIterator},
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, FixedSize, Read, ReadExt, ReadRangeExt, Write};
use commonware_cryptography::sha256::Digest;

/// An inclusion proof for a set of leaves against a forest's root tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    /// Leaf cursor of the forest the proof was built from (determines which
    /// roots exist and where).
    pub max_leaf: u64,
    /// Row count of that forest.
    pub rows: u8,
    /// Positions of the proven leaves, strictly ascending.
    pub targets: Vec<u64>,
    /// Hashes of the proven leaves, in target order.
    pub leaves: Vec<Digest>,
    /// Sibling hashes in traversal order.
    pub siblings: Vec<Digest>,
}

impl Proof {
    /// Verify the proof against `expected_roots`, the forest's root tuple
    /// left to right. Requires no access to the forest itself.
    pub fn verify(&self, expected_roots: &[Digest]) -> Result<(), Error> {
        let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
        if expected_roots.len() != peaks.len() {
            return Err(Error::RootMismatch);
        }
        if self.targets.len() != self.leaves.len() {
            return Err(Error::MissingSiblings);
        }

        // targets must be strictly ascending live leaf slots holding
        // non-empty hashes
        let mut prev = None;
        for (target, leaf) in self.targets.iter().zip(&self.leaves) {
            if *target >= self.max_leaf || is_empty(leaf) {
                return Err(Error::InvalidProofPosition(*target));
            }
            if prev.map(|prev| prev >= *target).unwrap_or(false) {
                return Err(Error::InvalidProofPosition(*target));
            }
            prev = Some(*target);
        }

        let mut siblings = self.siblings.iter();
        let mut current: Vec<(u64, Digest)> = self
            .targets
            .iter()
            .copied()
            .zip(self.leaves.iter().cloned())
            .collect();
        for _ in 0..=self.rows {
            if current.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(current.len());
            let mut i = 0;
            while i < current.len() {
                let (pos, value) = current[i].clone();
                if let Some(peak) = peaks.iter().position(|(peak, _)| *peak == pos) {
                    if expected_roots[peak] != value {
                        return Err(Error::RootMismatch);
                    }
                    i += 1;
                    continue;
                }
                let sibling = if i + 1 < current.len() && current[i + 1].0 == pos | 1 {
                    let (_, sibling) = current[i + 1].clone();
                    i += 2;
                    sibling
                } else {
                    let sibling = siblings.next().ok_or(Error::MissingSiblings)?.clone();
                    i += 1;
                    sibling
                };
                let (left, right) = if pos & 1 == 0 {
                    (value, sibling)
                } else {
                    (sibling, value)
                };
                next.push((position::parent(pos, self.rows), merge(&left, &right)));
            }
            current = next;
        }
        if !current.is_empty() {
            return Err(Error::InvalidProofPosition(current[0].0));
        }
        if siblings.next().is_some() {
            return Err(Error::ExtraSiblings);
        }
        Ok(())
    }
}

impl EncodeSize for Proof {
    fn encode_size(&self) -> usize {
        u64::SIZE
            + 1
            + self.targets.encode_size()
            + self.leaves.encode_size()
            + self.siblings.encode_size()
    }
}

impl Write for Proof {
    fn write(&self, buf: &mut impl BufMut) {
        self.max_leaf.write(buf);
        self.rows.write(buf);
        self.targets.write(buf);
        self.leaves.write(buf);
        self.siblings.write(buf);
    }
}

impl Read for Proof {
    /// The maximum number of targets accepted.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_targets: &Self::Cfg) -> Result<Self, commonware_codec::Error> {
        let max_leaf = u64::read(buf)?;
        let rows = u8::read(buf)?;
        let targets = Vec::<u64>::read_range(buf, ..=*max_targets)?;
        let leaves = Vec::<Digest>::read_range(buf, ..=*max_targets)?;
        // each target contributes at most one sibling per row
        let max_siblings = max_targets.saturating_mul(rows as usize + 1);
        let siblings = Vec::<Digest>::read_range(buf, ..=max_siblings)?;
        Ok(Self {
            max_leaf,
            rows,
            targets,
            leaves,
            siblings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::hash;

    #[test]
    fn test_codec_roundtrip() {
        let proof = Proof {
            max_leaf: 4,
            rows: 2,
            targets: vec![2],
            leaves: vec![hash(&[3u8])],
            siblings: vec![hash(&[4u8]), hash(&[1u8])],
        };
        let mut encoded = Vec::with_capacity(proof.encode_size());
        proof.write(&mut encoded);
        assert_eq!(encoded.len(), proof.encode_size());

        let mut buf = encoded.as_slice();
        let decoded = Proof::read_cfg(&mut buf, &16).unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded, proof);
    }

    #[test]
    fn test_codec_bounds() {
        let proof = Proof {
            max_leaf: 100,
            rows: 7,
            targets: (0..32).collect(),
            leaves: (0..32).map(|i| hash(&[i as u8])).collect(),
            siblings: Vec::new(),
        };
        let mut encoded = Vec::new();
        proof.write(&mut encoded);
        let mut buf = encoded.as_slice();
        assert!(Proof::read_cfg(&mut buf, &16).is_err());
    }
}
