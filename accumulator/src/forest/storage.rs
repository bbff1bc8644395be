//! Implementation of the forest engine.

use super::{Config, Error, Leaf, Proof, UndoBlock};
use crate::{
    hasher::{empty, is_empty, merge, mini},
    position::{self, RootIterator},
    store::{Config as StoreConfig, MemStore, Store, SLOT_SIZE},
};
use bytes::BufMut;
use commonware_cryptography::sha256::Digest;
use commonware_runtime::{Blob, Metrics, Storage as RStorage};
use commonware_storage::index::Index;
use commonware_storage::translator::EightCap;
use commonware_utils::hex;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use tracing::{debug, trace};

/// Name of the blob holding the misc record within the forest partition.
const MISC_BLOB: &[u8] = b"misc";

/// Name of the blob holding a dumped slot array within the forest partition.
/// Matches the flat-blob store layout so a dump can be reopened on disk.
const FOREST_BLOB: &[u8] = b"forest";

/// Length of the misc record: the 8-byte leaf cursor plus the row count.
const MISC_SIZE: u64 = 9;

/// Upper bound on the bytes moved per blob call when dumping or restoring
/// (single reads larger than this may be rejected by the platform).
const MAX_IO: u64 = 1 << 30;

/// A dynamic accumulator over a set of 32-byte leaf hashes.
pub struct Forest<E: RStorage + Metrics> {
    context: E,
    partition: String,
    store: Store<E>,

    /// MiniHash of each live leaf -> its position. Keys are the leaves'
    /// 8-byte prefixes (see [crate::hasher::mini]); prefix collisions are
    /// tolerated by reading the slot back on lookup.
    position_map: Index<EightCap, u64>,

    /// Number of live leaves.
    num_leaves: u64,
    /// Append cursor: total leaves ever added. Additions land here, and the
    /// 1-bits of this cursor determine which roots exist. Swapless deletion
    /// never moves survivors, so deleting leaves does not free slots.
    max_leaf: u64,
    /// Rows in the forest. Grows when capacity demands it, never shrinks.
    rows: u8,

    leaves: Gauge,
    hashes: Counter,
    adds: Counter,
    deletes: Counter,
}

impl<E: RStorage + Metrics> Forest<E> {
    /// Create an empty forest on the backend selected by `cfg`.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let mut store = Store::init(context.with_label("store"), cfg.store).await?;
        if store.size() == 0 {
            store.resize(position::max_position(0)).await?;
        }
        let position_map = Index::init(context.with_label("position_map"), EightCap);
        let metrics = ForestMetrics::register(&context);
        Ok(Self {
            context,
            partition: cfg.partition,
            store,
            position_map,
            num_leaves: 0,
            max_leaf: 0,
            rows: 0,
            leaves: metrics.leaves,
            hashes: metrics.hashes,
            adds: metrics.adds,
            deletes: metrics.deletes,
        })
    }

    /// Number of live leaves.
    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    /// Append cursor (total leaves ever added).
    pub fn max_leaf(&self) -> u64 {
        self.max_leaf
    }

    /// Rows in the forest.
    pub fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of slots allocated by the backend.
    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// The forest's commitment: its root hashes, left to right. A root whose
    /// tree holds no live leaves is `EMPTY`.
    pub async fn roots(&mut self) -> Result<Vec<Digest>, Error> {
        let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
        let mut roots = Vec::with_capacity(peaks.len());
        for (pos, _) in peaks {
            roots.push(self.store.read(pos).await?);
        }
        Ok(roots)
    }

    /// Whether a leaf with `hash` is live in the forest.
    pub async fn find_leaf(&mut self, hash: &Digest) -> Result<bool, Error> {
        let candidates: Vec<u64> = self.position_map.get(&mini(hash)).copied().collect();
        for pos in candidates {
            if self.store.read(pos).await? == *hash {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply one block of changes: delete the leaves at the (unsorted)
    /// positions `dels`, then append `adds` to the right. Returns the data
    /// needed to [Forest::undo] the modification.
    ///
    /// On error the forest may be partially modified and must be considered
    /// corrupt.
    pub async fn modify(&mut self, adds: &[Leaf], dels: &[u64]) -> Result<UndoBlock, Error> {
        for add in adds {
            if is_empty(&add.hash) {
                return Err(Error::EmptyLeaf);
            }
        }
        if dels.len() as u64 > self.num_leaves {
            return Err(Error::ExcessiveDeletions {
                dels: dels.len() as u64,
                leaves: self.num_leaves,
            });
        }
        let mut dels = dels.to_vec();
        dels.sort_unstable();
        for pair in dels.windows(2) {
            if pair[0] == pair[1] {
                return Err(Error::DuplicateDeletion(pair[0]));
            }
        }
        for &del in &dels {
            if del >= self.max_leaf || is_empty(&self.store.read(del).await?) {
                return Err(Error::UnknownPosition(del));
            }
        }
        debug!(adds = adds.len(), dels = dels.len(), "modifying forest");

        // grow until the additions fit to the right of the cursor
        while self.max_leaf + adds.len() as u64 > 1u64 << self.rows {
            self.remap(self.rows + 1).await?;
        }

        let deleted = self.remove(&dels).await?;
        let undo = UndoBlock {
            num_adds: adds.len() as u64,
            deleted,
        };
        self.add(adds).await?;
        Ok(undo)
    }

    /// Append leaves at the cursor, merging with existing roots per the
    /// 1-bits of the cursor.
    async fn add(&mut self, adds: &[Leaf]) -> Result<(), Error> {
        for add in adds {
            let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
            let mut pos = self.max_leaf;
            let mut node = add.hash.clone();
            self.store.write(pos, &node).await?;
            self.position_map.insert(&add.mini(), pos);
            trace!(pos, "added leaf");

            // one merge per trailing 1-bit: the roots at rows 0..k are
            // exactly the subtrees immediately left of the new leaf's path
            let mut row = 0u8;
            while (self.max_leaf >> row) & 1 == 1 {
                let (root_pos, _) = peaks[peaks.len() - 1 - row as usize];
                let root = self.store.read(root_pos).await?;
                if !is_empty(&root) {
                    self.hashes.inc();
                }
                node = merge(&root, &node);
                pos = position::parent(pos, self.rows);
                self.store.write(pos, &node).await?;
                row += 1;
            }
            self.max_leaf += 1;
            self.num_leaves += 1;
            self.adds.inc();
        }
        self.leaves.set(self.num_leaves as i64);
        Ok(())
    }

    /// Swapless deletion: clear the deleted slots, collapse each condensed
    /// subtree out of its pair, and re-hash above the surviving values.
    async fn remove(&mut self, dels: &[u64]) -> Result<Vec<(u64, Digest)>, Error> {
        if dels.is_empty() {
            return Ok(Vec::new());
        }
        let mut deleted = Vec::with_capacity(dels.len());
        for &del in dels {
            let hash = self.store.read(del).await?;
            let key = mini(&hash);
            trace!(pos = del, leaf = %hex(&key), "deleting leaf");
            self.position_map.prune(&key, |pos| *pos == del);
            self.store.write(del, &empty()).await?;
            deleted.push((del, hash));
            self.deletes.inc();
        }

        let mut dirt: Vec<u64> = Vec::new();
        for &root in &position::condense(dels, self.rows) {
            if position::detect_row(root, self.rows) > 0 {
                // a whole subtree is gone: empty its top so the pair above
                // collapses around it
                self.store.write(root, &empty()).await?;
            }
            // Promote while the pair at the current level is lonely (one
            // member EMPTY): the surviving value rises without hashing. The
            // first fully live pair is left as dirt for re-hashing.
            let mut pos = root;
            while !self.is_root(pos) {
                let own = self.store.read(pos).await?;
                let sibling = self.store.read(position::sibling(pos)).await?;
                if !is_empty(&own) && !is_empty(&sibling) {
                    if dirt.last() != Some(&pos) {
                        dirt.push(pos);
                    }
                    break;
                }
                let parent = position::parent(pos, self.rows);
                self.store.write(parent, &merge(&own, &sibling)).await?;
                pos = parent;
            }
        }
        self.num_leaves -= dels.len() as u64;
        self.leaves.set(self.num_leaves as i64);
        self.rehash(&dirt).await?;
        Ok(deleted)
    }

    /// Whether `pos` is one of the forest's roots.
    fn is_root(&self, pos: u64) -> bool {
        RootIterator::new(self.max_leaf, self.rows).any(|(root, _)| root == pos)
    }

    /// Recompute ancestors of the dirty positions, row by row. Sibling pairs
    /// are processed once, roots are left alone, and the collapse rule
    /// applies: a pair with an `EMPTY` member promotes its survivor.
    async fn rehash(&mut self, dirt: &[u64]) -> Result<(), Error> {
        if dirt.is_empty() || self.rows == 0 {
            return Ok(());
        }
        let mut by_row: Vec<Vec<u64>> = vec![Vec::new(); self.rows as usize];
        for &pos in dirt {
            let row = position::detect_row(pos, self.rows);
            if row >= self.rows || !position::in_forest(pos, self.max_leaf, self.rows) {
                return Err(Error::DirtOutOfBounds {
                    pos,
                    leaves: self.max_leaf,
                });
            }
            by_row[row as usize].push(pos);
        }

        let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
        let mut current: Vec<u64> = Vec::new();
        for row in 0..self.rows {
            current = position::merge_sorted(&current, &by_row[row as usize]);
            if current.is_empty() {
                continue;
            }
            let peak = peaks.iter().find(|(_, r)| *r == row).map(|(pos, _)| *pos);
            let mut next = Vec::with_capacity(current.len());
            let mut i = 0;
            while i < current.len() {
                let pos = current[i];
                // the pair is processed once even if both members are dirty
                if i + 1 < current.len() && current[i + 1] == pos | 1 {
                    i += 2;
                } else {
                    i += 1;
                }
                if Some(pos) == peak {
                    continue;
                }
                let right = pos | 1;
                let left = right ^ 1;
                let left_value = self.store.read(left).await?;
                let right_value = self.store.read(right).await?;
                if !is_empty(&left_value) && !is_empty(&right_value) {
                    self.hashes.inc();
                }
                let parent = position::parent(left, self.rows);
                self.store.write(parent, &merge(&left_value, &right_value)).await?;
                next.push(parent);
            }
            current = next;
        }
        Ok(())
    }

    /// Grow the forest by one row, relocating every internal node to its
    /// position in the wider layout. The bottom row does not move.
    async fn remap(&mut self, dest_rows: u8) -> Result<(), Error> {
        if dest_rows != self.rows + 1 {
            return Err(Error::CapacityStep {
                from: self.rows,
                to: dest_rows,
            });
        }
        debug!(from = self.rows, to = dest_rows, "growing forest");
        self.store.resize(position::max_position(dest_rows)).await?;
        // in the new numbering a row's old positions are its new positions
        // shifted down one row, so each row relocates with a single range
        // swap (which also clears the vacated slots)
        let mut start = 1u64 << dest_rows;
        let mut reach = start >> 1;
        for _ in 1..dest_rows {
            let width = reach >> 1;
            self.store.swap_range(start, start >> 1, width).await?;
            start += reach;
            reach >>= 1;
        }
        self.rows = dest_rows;
        Ok(())
    }

    /// Reverse one [Forest::modify]: drop its additions from the right, then
    /// reinstate its deletions and re-hash above them. Does not shrink rows
    /// grown by the modification.
    pub async fn undo(&mut self, undo: UndoBlock) -> Result<(), Error> {
        if undo.num_adds > self.num_leaves || undo.num_adds > self.max_leaf {
            return Err(Error::InvalidUndo);
        }
        for _ in 0..undo.num_adds {
            let pos = self.max_leaf - 1;
            let hash = self.store.read(pos).await?;
            if is_empty(&hash) {
                return Err(Error::InvalidUndo);
            }
            self.position_map.prune(&mini(&hash), |p| *p == pos);
            self.store.write(pos, &empty()).await?;
            self.max_leaf -= 1;
            self.num_leaves -= 1;
        }
        let mut dirt = Vec::with_capacity(undo.deleted.len());
        for (pos, hash) in &undo.deleted {
            if *pos >= self.max_leaf || is_empty(hash) {
                return Err(Error::InvalidUndo);
            }
            self.store.write(*pos, hash).await?;
            self.position_map.insert(&mini(hash), *pos);
            dirt.push(*pos);
        }
        self.num_leaves += undo.deleted.len() as u64;
        self.leaves.set(self.num_leaves as i64);
        self.rehash(&dirt).await?;
        Ok(())
    }

    /// Build a [Proof] for the given live leaf hashes.
    pub async fn prove(&mut self, hashes: &[Digest]) -> Result<Proof, Error> {
        let mut targets = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if is_empty(hash) {
                return Err(Error::EmptyLeaf);
            }
            let candidates: Vec<u64> = self.position_map.get(&mini(hash)).copied().collect();
            let mut found = None;
            for pos in candidates {
                if self.store.read(pos).await? == *hash {
                    found = Some(pos);
                    break;
                }
            }
            let pos = found.ok_or_else(|| Error::UnknownLeaf(hash.clone()))?;
            targets.push((pos, hash.clone()));
        }
        targets.sort_by_key(|(pos, _)| *pos);
        targets.dedup_by_key(|(pos, _)| *pos);

        // walk upward in re-hash order: pairs of targets authenticate each
        // other, everything else pulls its sibling from the store (EMPTY
        // siblings included: the verifier promotes across them)
        let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
        let mut siblings = Vec::new();
        let mut current: Vec<u64> = targets.iter().map(|(pos, _)| *pos).collect();
        for _ in 0..=self.rows {
            if current.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(current.len());
            let mut i = 0;
            while i < current.len() {
                let pos = current[i];
                if peaks.iter().any(|(peak, _)| *peak == pos) {
                    i += 1;
                    continue;
                }
                if i + 1 < current.len() && current[i + 1] == pos | 1 {
                    i += 2;
                } else {
                    siblings.push(self.store.read(position::sibling(pos)).await?);
                    i += 1;
                }
                next.push(position::parent(pos, self.rows));
            }
            current = next;
        }

        Ok(Proof {
            max_leaf: self.max_leaf,
            rows: self.rows,
            leaves: targets.iter().map(|(_, hash)| hash.clone()).collect(),
            targets: targets.into_iter().map(|(pos, _)| pos).collect(),
            siblings,
        })
    }

    /// Cheap structural checks: counts in range and, when the forest has no
    /// holes, every root populated.
    pub async fn sanity(&mut self) -> Result<(), Error> {
        if self.num_leaves > self.max_leaf {
            return Err(Error::Sanity(format!(
                "{} live leaves above cursor {}",
                self.num_leaves, self.max_leaf
            )));
        }
        if self.max_leaf > 1u64 << self.rows {
            return Err(Error::Sanity(format!(
                "cursor {} but only {} rows",
                self.max_leaf, self.rows
            )));
        }
        if self.num_leaves == self.max_leaf {
            let peaks: Vec<(u64, u8)> = RootIterator::new(self.max_leaf, self.rows).collect();
            for (pos, _) in peaks {
                if is_empty(&self.store.read(pos).await?) {
                    return Err(Error::Sanity(format!("root at {pos} is empty")));
                }
            }
        }
        if self.position_map.keys() as u64 > self.num_leaves {
            return Err(Error::Sanity(format!(
                "position map holds {} keys for {} leaves",
                self.position_map.keys(),
                self.num_leaves
            )));
        }
        Ok(())
    }

    /// Expensive check: for every occupied leaf slot, the MiniHash of its
    /// contents maps back to that slot.
    pub async fn position_map_sanity(&mut self) -> Result<(), Error> {
        for pos in 0..self.max_leaf {
            let hash = self.store.read(pos).await?;
            if is_empty(&hash) {
                continue;
            }
            let candidates: Vec<u64> = self.position_map.get(&mini(&hash)).copied().collect();
            if !candidates.contains(&pos) {
                return Err(Error::Sanity(format!(
                    "position map does not map {} back to {pos}",
                    hex(&mini(&hash))
                )));
            }
        }
        Ok(())
    }

    /// Persist the misc record: the 8-byte big-endian leaf cursor and the
    /// row count.
    pub async fn write_misc(&self) -> Result<(), Error> {
        let (blob, _) = self.context.open(&self.partition, MISC_BLOB).await?;
        let mut buf = Vec::with_capacity(MISC_SIZE as usize);
        buf.put_u64(self.max_leaf);
        buf.put_u8(self.rows);
        blob.write_at(buf, 0).await?;
        blob.sync().await?;
        blob.close().await?;
        Ok(())
    }

    /// Dump the slot array verbatim (RAM backend only), in the flat-blob
    /// layout shared with the disk backends.
    pub async fn dump(&self) -> Result<(), Error> {
        let Some(mem) = self.store.as_mem() else {
            return Err(Error::WrongBackend(self.store.name()));
        };
        let (blob, size) = self.context.open(&self.partition, FOREST_BLOB).await?;
        let mut offset = 0u64;
        for chunk in mem.digests().chunks((MAX_IO / SLOT_SIZE) as usize) {
            let mut buf = Vec::with_capacity(chunk.len() * SLOT_SIZE as usize);
            for digest in chunk {
                buf.extend_from_slice(digest.as_ref());
            }
            let len = buf.len() as u64;
            blob.write_at(buf, offset).await?;
            offset += len;
        }
        if size > offset {
            blob.resize(offset).await?;
        }
        blob.sync().await?;
        blob.close().await?;
        Ok(())
    }

    /// Flush the backend.
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.store.sync().await?;
        Ok(())
    }

    /// Flush and release the backend.
    pub async fn close(self) -> Result<(), Error> {
        self.store.close().await?;
        Ok(())
    }

    /// Reopen a persisted forest: read the misc record, open the backend
    /// selected by `cfg.store` (for the RAM backend, load the dumped slot
    /// array in bounded reads), and rebuild the position map by scanning the
    /// occupied leaf slots.
    pub async fn restore(context: E, cfg: Config) -> Result<Self, Error> {
        let (misc, misc_size) = context.open(&cfg.partition, MISC_BLOB).await?;
        if misc_size < MISC_SIZE {
            return Err(Error::CorruptMiscFile(misc_size));
        }
        let read = misc.read_at(vec![0u8; MISC_SIZE as usize], 0).await?;
        let max_leaf = u64::from_be_bytes(read.as_ref()[0..8].try_into().unwrap());
        let rows = read.as_ref()[8];
        misc.close().await?;

        let slots = position::max_position(rows);
        let mut store = match cfg.store {
            StoreConfig::Mem => {
                let (blob, size) = context.open(&cfg.partition, FOREST_BLOB).await?;
                let expected = slots * SLOT_SIZE;
                if size < expected {
                    return Err(Error::TruncatedForest { size, expected });
                }
                let mut digests = Vec::with_capacity(slots as usize);
                let mut offset = 0u64;
                while offset < expected {
                    let len = std::cmp::min(MAX_IO, expected - offset);
                    let read = blob.read_at(vec![0u8; len as usize], offset).await?;
                    for chunk in read.as_ref().chunks_exact(SLOT_SIZE as usize) {
                        let mut digest = [0u8; SLOT_SIZE as usize];
                        digest.copy_from_slice(chunk);
                        digests.push(Digest::from(digest));
                    }
                    offset += len;
                }
                blob.close().await?;
                Store::Mem(MemStore::from_digests(digests))
            }
            other => {
                let mut store = Store::init(context.with_label("store"), other).await?;
                if store.size() < slots {
                    store.resize(slots).await?;
                }
                store
            }
        };

        let mut position_map = Index::init(context.with_label("position_map"), EightCap);
        let mut num_leaves = 0u64;
        for pos in 0..max_leaf {
            let hash = store.read(pos).await?;
            if is_empty(&hash) {
                continue;
            }
            position_map.insert(&mini(&hash), pos);
            num_leaves += 1;
        }
        debug!(max_leaf, num_leaves, rows, "restored forest");

        let metrics = ForestMetrics::register(&context);
        metrics.leaves.set(num_leaves as i64);
        Ok(Self {
            context,
            partition: cfg.partition,
            store,
            position_map,
            num_leaves,
            max_leaf,
            rows,
            leaves: metrics.leaves,
            hashes: metrics.hashes,
            adds: metrics.adds,
            deletes: metrics.deletes,
        })
    }
}

struct ForestMetrics {
    leaves: Gauge,
    hashes: Counter,
    adds: Counter,
    deletes: Counter,
}

impl ForestMetrics {
    fn register(context: &impl Metrics) -> Self {
        let leaves = Gauge::default();
        let hashes = Counter::default();
        let adds = Counter::default();
        let deletes = Counter::default();
        context.register("leaves", "Number of live leaves", leaves.clone());
        context.register("hashes", "Number of parent hashes computed", hashes.clone());
        context.register("adds", "Number of leaves added", adds.clone());
        context.register("deletes", "Number of leaves deleted", deletes.clone());
        Self {
            leaves,
            hashes,
            adds,
            deletes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hasher::parent_hash,
        store::{CachedConfig, CowConfig, DiskConfig},
    };
    use commonware_cryptography::hash;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use rand::Rng;
    use std::collections::BTreeMap;

    fn leaf(value: u64) -> Leaf {
        Leaf::new(hash(&value.to_be_bytes()), false)
    }

    fn mem_config(partition: &str) -> Config {
        Config {
            partition: partition.into(),
            store: StoreConfig::Mem,
        }
    }

    /// Recompute every root from the live leaves alone, folding each tree
    /// with the collapse rule.
    fn model_roots(live: &BTreeMap<u64, Digest>, max_leaf: u64, rows: u8) -> Vec<Digest> {
        fn subtree(pos: u64, row: u8, rows: u8, live: &BTreeMap<u64, Digest>) -> Digest {
            if row == 0 {
                return live.get(&pos).cloned().unwrap_or_else(empty);
            }
            let left = position::left_child(pos, rows);
            merge(
                &subtree(left, row - 1, rows, live),
                &subtree(left | 1, row - 1, rows, live),
            )
        }
        RootIterator::new(max_leaf, rows)
            .map(|(pos, row)| subtree(pos, row, rows, live))
            .collect()
    }

    #[test_traced]
    fn test_add_four_known_root() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context.clone(), mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (1u8..=4).map(|k| Leaf::new(hash(&[k]), false)).collect();
            forest.modify(&leaves, &[]).await.unwrap();

            assert_eq!(forest.num_leaves(), 4);
            assert_eq!(forest.max_leaf(), 4);
            assert_eq!(forest.rows(), 2);
            let expected = parent_hash(
                &parent_hash(&leaves[0].hash, &leaves[1].hash),
                &parent_hash(&leaves[2].hash, &leaves[3].hash),
            );
            assert_eq!(forest.roots().await.unwrap(), vec![expected]);

            let buffer = context.encode();
            assert!(buffer.contains("leaves 4"));
            assert!(buffer.contains("adds_total 4"));
        });
    }

    #[test_traced]
    fn test_delete_and_prove() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (1u8..=4).map(|k| Leaf::new(hash(&[k]), false)).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            forest.modify(&[], &[1]).await.unwrap();

            assert_eq!(forest.num_leaves(), 3);
            // survivors stay at their original slots
            assert_eq!(forest.store.read(0).await.unwrap(), leaves[0].hash);
            assert_eq!(forest.store.read(2).await.unwrap(), leaves[2].hash);
            assert_eq!(forest.store.read(3).await.unwrap(), leaves[3].hash);
            assert_eq!(forest.store.read(1).await.unwrap(), empty());

            // the deleted pair collapsed: its survivor rose unhashed
            let expected = parent_hash(
                &leaves[0].hash,
                &parent_hash(&leaves[2].hash, &leaves[3].hash),
            );
            let roots = forest.roots().await.unwrap();
            assert_eq!(roots, vec![expected]);

            let proof = forest.prove(&[leaves[2].hash.clone()]).await.unwrap();
            assert_eq!(proof.targets, vec![2]);
            proof.verify(&roots).unwrap();

            // the promoted survivor proves too
            let proof = forest.prove(&[leaves[0].hash.clone()]).await.unwrap();
            assert_eq!(proof.targets, vec![0]);
            proof.verify(&roots).unwrap();

            assert!(!forest.find_leaf(&leaves[1].hash).await.unwrap());
            forest.sanity().await.unwrap();
            forest.position_map_sanity().await.unwrap();
        });
    }

    #[test_traced]
    fn test_empty_leaf_rejected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            let result = forest.modify(&[Leaf::new(empty(), false)], &[]).await;
            assert!(matches!(result, Err(Error::EmptyLeaf)));
            assert_eq!(forest.num_leaves(), 0);
        });
    }

    #[test_traced]
    fn test_remap_growth() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (0..8).map(leaf).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            assert_eq!(forest.rows(), 3);
            assert_eq!(forest.store_size(), 15);
            let before = forest.roots().await.unwrap();
            assert_eq!(before.len(), 1);

            // one more leaf forces a remap; the relocated tree keeps its root
            forest.modify(&[leaf(8)], &[]).await.unwrap();
            assert_eq!(forest.rows(), 4);
            assert_eq!(forest.store_size(), 31);
            let after = forest.roots().await.unwrap();
            assert_eq!(after.len(), 2);
            assert_eq!(after[0], before[0]);
            assert_eq!(after[1], leaf(8).hash);

            // relocated internals are where the wider layout expects them
            let pair = parent_hash(&leaf(0).hash, &leaf(1).hash);
            assert_eq!(forest.store.read(16).await.unwrap(), pair);
            assert_eq!(
                forest.store.read(24).await.unwrap(),
                parent_hash(&pair, &parent_hash(&leaf(2).hash, &leaf(3).hash)),
            );
            forest.sanity().await.unwrap();
        });
    }

    #[test_traced]
    fn test_delete_all_then_add() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (0..4).map(leaf).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            forest.modify(&[], &[0, 1, 2, 3]).await.unwrap();

            // a fully dead tree shows an EMPTY root
            assert_eq!(forest.num_leaves(), 0);
            assert_eq!(forest.roots().await.unwrap(), vec![empty()]);

            // new leaves land to the right and merge across the dead tree
            forest.modify(&[leaf(10)], &[]).await.unwrap();
            let roots = forest.roots().await.unwrap();
            assert_eq!(roots, vec![empty(), leaf(10).hash]);
            let proof = forest.prove(&[leaf(10).hash]).await.unwrap();
            proof.verify(&roots).unwrap();

            forest.modify(&[leaf(11)], &[]).await.unwrap();
            let roots = forest.roots().await.unwrap();
            assert_eq!(roots, vec![empty(), parent_hash(&leaf(10).hash, &leaf(11).hash)]);
        });
    }

    #[test_traced]
    fn test_persistence_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context.clone(), mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (0..17).map(leaf).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            let roots = forest.roots().await.unwrap();

            forest.write_misc().await.unwrap();
            forest.dump().await.unwrap();
            forest.close().await.unwrap();

            // back into RAM
            let mut restored = Forest::restore(context.with_label("ram"), mem_config("forest")).await.unwrap();
            assert_eq!(restored.num_leaves(), 17);
            assert_eq!(restored.max_leaf(), 17);
            assert_eq!(restored.roots().await.unwrap(), roots);
            for leaf in &leaves {
                assert!(restored.find_leaf(&leaf.hash).await.unwrap());
            }
            restored.position_map_sanity().await.unwrap();

            // the dump shares the flat-blob layout, so it reopens on disk too
            let cfg = Config {
                partition: "forest".into(),
                store: StoreConfig::Disk(DiskConfig {
                    partition: "forest".into(),
                }),
            };
            let mut on_disk = Forest::restore(context.with_label("disk"), cfg).await.unwrap();
            assert_eq!(on_disk.num_leaves(), 17);
            assert_eq!(on_disk.roots().await.unwrap(), roots);
            on_disk.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_backend_equivalence() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let configs = vec![
                mem_config("forest_mem"),
                Config {
                    partition: "forest_disk".into(),
                    store: StoreConfig::Disk(DiskConfig {
                        partition: "forest_disk".into(),
                    }),
                },
                Config {
                    partition: "forest_cached".into(),
                    store: StoreConfig::Cached(CachedConfig {
                        partition: "forest_cached".into(),
                        cached_rows: 2,
                    }),
                },
                Config {
                    partition: "forest_cow".into(),
                    store: StoreConfig::Cow(CowConfig {
                        partition: "forest_cow".into(),
                        max_cache: 64 * 1024,
                    }),
                },
            ];
            let mut forests = Vec::new();
            for cfg in configs {
                let label = cfg.partition.clone();
                forests.push(Forest::init(context.with_label(&label), cfg).await.unwrap());
            }

            let steps: Vec<(Vec<Leaf>, Vec<u64>)> = vec![
                ((0..6).map(leaf).collect(), vec![]),
                ((6..9).map(leaf).collect(), vec![1, 4]),
                (vec![], vec![0, 5, 7]),
                ((9..14).map(leaf).collect(), vec![2]),
                (vec![leaf(14)], vec![3, 8, 9]),
            ];
            for (adds, dels) in steps {
                let mut roots = Vec::new();
                for forest in forests.iter_mut() {
                    forest.modify(&adds, &dels).await.unwrap();
                    roots.push(forest.roots().await.unwrap());
                }
                for other in roots.iter().skip(1) {
                    assert_eq!(&roots[0], other);
                }
            }

            // identical traces leave identical live slots
            let max_leaf = forests[0].max_leaf();
            for pos in 0..max_leaf {
                let expected = forests[0].store.read(pos).await.unwrap();
                for forest in forests.iter_mut().skip(1) {
                    assert_eq!(forest.store.read(pos).await.unwrap(), expected, "slot {pos}");
                }
            }
            for forest in forests.iter_mut() {
                forest.sanity().await.unwrap();
                forest.position_map_sanity().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_random_ops_match_model() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let mut forest = Forest::init(context.clone(), mem_config("forest")).await.unwrap();
            let mut model: BTreeMap<u64, Digest> = BTreeMap::new();
            let mut next = 0u64;
            for _ in 0..40 {
                let num_adds = context.gen_range(0..6);
                let adds: Vec<Leaf> = (0..num_adds)
                    .map(|_| {
                        next += 1;
                        leaf(next)
                    })
                    .collect();
                let dels: Vec<u64> = model
                    .keys()
                    .copied()
                    .filter(|_| context.gen_bool(0.2))
                    .collect();

                let base = forest.max_leaf();
                forest.modify(&adds, &dels).await.unwrap();
                for del in &dels {
                    model.remove(del);
                }
                for (i, add) in adds.iter().enumerate() {
                    model.insert(base + i as u64, add.hash.clone());
                }

                assert_eq!(forest.num_leaves(), model.len() as u64);
                let expected = model_roots(&model, forest.max_leaf(), forest.rows());
                assert_eq!(forest.roots().await.unwrap(), expected);
                forest.sanity().await.unwrap();

                // every live leaf stays provable
                if !model.is_empty() {
                    let sample: Vec<Digest> = model
                        .values()
                        .filter(|_| context.gen_bool(0.3))
                        .cloned()
                        .collect();
                    if !sample.is_empty() {
                        let proof = forest.prove(&sample).await.unwrap();
                        let roots = forest.roots().await.unwrap();
                        proof.verify(&roots).unwrap();
                    }
                }
            }
            forest.position_map_sanity().await.unwrap();
        });
    }

    #[test_traced]
    fn test_modify_undo_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let mut forest = Forest::init(context.clone(), mem_config("forest")).await.unwrap();
            // plenty of capacity up front so the round trips never remap
            let leaves: Vec<Leaf> = (0..12).map(leaf).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            forest.modify(&[], &[4, 9]).await.unwrap();

            let mut next = 100u64;
            for _ in 0..20 {
                let before_roots = forest.roots().await.unwrap();
                let before_counts = (forest.num_leaves(), forest.max_leaf(), forest.rows());
                let mut before_slots = Vec::new();
                for pos in 0..forest.max_leaf() {
                    before_slots.push(forest.store.read(pos).await.unwrap());
                }

                let live: Vec<u64> = {
                    let mut live = Vec::new();
                    for pos in 0..forest.max_leaf() {
                        if !is_empty(&forest.store.read(pos).await.unwrap()) {
                            live.push(pos);
                        }
                    }
                    live
                };
                let dels: Vec<u64> = live.into_iter().filter(|_| context.gen_bool(0.25)).collect();
                let adds: Vec<Leaf> = (0..context.gen_range(0..3))
                    .map(|_| {
                        next += 1;
                        leaf(next)
                    })
                    .collect();

                let undo = forest.modify(&adds, &dels).await.unwrap();
                forest.undo(undo).await.unwrap();

                assert_eq!(forest.roots().await.unwrap(), before_roots);
                assert_eq!(
                    (forest.num_leaves(), forest.max_leaf(), forest.rows()),
                    before_counts
                );
                for (pos, expected) in before_slots.iter().enumerate() {
                    assert_eq!(&forest.store.read(pos as u64).await.unwrap(), expected, "slot {pos}");
                }
                forest.position_map_sanity().await.unwrap();
            }
        });
    }

    #[test_traced]
    fn test_minihash_collisions() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            // two leaves sharing a MiniHash: identical 8-byte prefixes,
            // different tails
            let mut colliding = [0xabu8; 32];
            colliding[31] = 1;
            let first = Leaf::new(Digest::from(colliding), false);
            colliding[31] = 2;
            let second = Leaf::new(Digest::from(colliding), false);
            assert_eq!(first.mini(), second.mini());

            let leaves = vec![first.clone(), second.clone(), leaf(3), leaf(4)];
            forest.modify(&leaves, &[]).await.unwrap();

            // both collide in the map but resolve to their own slots
            assert!(forest.find_leaf(&first.hash).await.unwrap());
            assert!(forest.find_leaf(&second.hash).await.unwrap());
            let proof = forest
                .prove(&[first.hash.clone(), second.hash.clone()])
                .await
                .unwrap();
            assert_eq!(proof.targets, vec![0, 1]);
            proof.verify(&forest.roots().await.unwrap()).unwrap();
            forest.position_map_sanity().await.unwrap();

            // deleting one colliding leaf must not take the other with it
            forest.modify(&[], &[0]).await.unwrap();
            assert!(!forest.find_leaf(&first.hash).await.unwrap());
            assert!(forest.find_leaf(&second.hash).await.unwrap());
            let proof = forest.prove(&[second.hash.clone()]).await.unwrap();
            assert_eq!(proof.targets, vec![1]);
            proof.verify(&forest.roots().await.unwrap()).unwrap();
            forest.position_map_sanity().await.unwrap();
        });
    }

    #[test_traced]
    fn test_proof_tampering() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context, mem_config("forest")).await.unwrap();
            let leaves: Vec<Leaf> = (0..8).map(leaf).collect();
            forest.modify(&leaves, &[]).await.unwrap();
            let roots = forest.roots().await.unwrap();
            let proof = forest
                .prove(&[leaves[2].hash.clone(), leaves[5].hash.clone()])
                .await
                .unwrap();
            proof.verify(&roots).unwrap();

            // mutated sibling
            let mut tampered = proof.clone();
            tampered.siblings[0] = hash(b"tampered");
            assert!(matches!(tampered.verify(&roots), Err(Error::RootMismatch)));

            // missing and extra siblings
            let mut tampered = proof.clone();
            tampered.siblings.pop();
            assert!(matches!(tampered.verify(&roots), Err(Error::MissingSiblings)));
            let mut tampered = proof.clone();
            tampered.siblings.push(hash(b"extra"));
            assert!(matches!(tampered.verify(&roots), Err(Error::ExtraSiblings)));

            // altered positions
            let mut tampered = proof.clone();
            tampered.targets[0] = 99;
            assert!(tampered.verify(&roots).is_err());
            let mut tampered = proof.clone();
            tampered.targets[0] = 3;
            assert!(tampered.verify(&roots).is_err());

            // wrong roots
            let mut wrong = roots.clone();
            wrong[0] = hash(b"not the root");
            assert!(matches!(proof.verify(&wrong), Err(Error::RootMismatch)));
        });
    }

    #[test_traced]
    fn test_validation_errors() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut forest = Forest::init(context.clone(), mem_config("forest")).await.unwrap();
            assert!(matches!(
                forest.modify(&[], &[0]).await,
                Err(Error::ExcessiveDeletions { dels: 1, leaves: 0 })
            ));

            forest.modify(&(0..4).map(leaf).collect::<Vec<_>>(), &[]).await.unwrap();
            assert!(matches!(
                forest.modify(&[], &[0, 0]).await,
                Err(Error::DuplicateDeletion(0))
            ));
            assert!(matches!(
                forest.modify(&[], &[7]).await,
                Err(Error::UnknownPosition(7))
            ));

            // deleting a hole is rejected
            forest.modify(&[], &[2]).await.unwrap();
            assert!(matches!(
                forest.modify(&[], &[2]).await,
                Err(Error::UnknownPosition(2))
            ));

            assert!(matches!(
                forest.prove(&[hash(b"nonexistent")]).await,
                Err(Error::UnknownLeaf(_))
            ));

            // growth happens one row at a time
            assert!(matches!(
                forest.remap(forest.rows() + 2).await,
                Err(Error::CapacityStep { from: 2, to: 4 })
            ));

            // dumping needs the RAM backend
            let cfg = Config {
                partition: "on_disk".into(),
                store: StoreConfig::Disk(DiskConfig {
                    partition: "on_disk".into(),
                }),
            };
            let disk_forest = Forest::init(context.with_label("on_disk"), cfg).await.unwrap();
            assert!(matches!(disk_forest.dump().await, Err(Error::WrongBackend("disk"))));
        });
    }

    #[test_traced]
    fn test_restore_corruption() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // undersized misc record
            {
                let (blob, _) = context.open("broken", MISC_BLOB).await.unwrap();
                blob.write_at(vec![0u8; 5], 0).await.unwrap();
                blob.close().await.unwrap();
            }
            let result = Forest::restore(context.clone(), mem_config("broken")).await;
            assert!(matches!(result, Err(Error::CorruptMiscFile(5))));

            // valid misc but no dumped slots
            let forest = Forest::init(context.with_label("no_dump"), mem_config("no_dump")).await.unwrap();
            forest.write_misc().await.unwrap();
            let result = Forest::restore(context.with_label("no_dump_restore"), mem_config("no_dump")).await;
            assert!(matches!(result, Err(Error::TruncatedForest { size: 0, .. })));
        });
    }
}
