//! Copy-on-write backend with a bounded in-memory write cache.
//!
//! Slots are grouped into chunks of 1024 hashes (32KiB). Dirty chunks
//! accumulate in memory until their total size exceeds the configured budget,
//! at which point every dirty chunk is written to a free region of the chunk
//! blob — never in place — and the chunk index is committed. Clean chunks are
//! read straight from the blob; chunks that were never written read as
//! `EMPTY`.
//!
//! # Crash consistency
//!
//! The chunk index (a version counter, the exposed slot count, the
//! chunk-number→blob-slot table, and a CRC32) is double buffered across two
//! blobs: a commit writes the chunk data, syncs it, then writes the index to
//! the blob holding the older version and syncs that. A torn index write
//! leaves the other blob's version intact, and a torn chunk write is never
//! referenced by any committed index. Blob slots superseded by a commit are
//! returned to the free list only after the index referencing their
//! replacements is durable.
//!
//! This backend's on-disk format is its own: it is not interchangeable with
//! the flat-blob backends.

use super::{Error, SLOT_SIZE};
use crate::hasher::empty;
use bytes::BufMut;
use commonware_cryptography::sha256::Digest;
use commonware_runtime::{Blob, Metrics, Storage as RStorage};
use prometheus_client::metrics::counter::Counter;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const CHUNK_BLOB: &[u8] = b"chunks";
const INDEX_BLOBS: [&[u8]; 2] = [b"index_0", b"index_1"];

/// Hashes per chunk.
const CHUNK_HASHES: u64 = 1024;
const CHUNK_BYTES: u64 = CHUNK_HASHES * SLOT_SIZE;

/// Table entry for a chunk that was never flushed.
const NO_SLOT: u64 = u64::MAX;

/// Configuration for [CowStore].
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition holding the chunk and
    /// index blobs.
    pub partition: String,

    /// Byte budget for dirty chunks held in memory. Exceeding it triggers a
    /// flush of all dirty chunks.
    pub max_cache: usize,
}

/// Copy-on-write backend.
pub struct CowStore<E: RStorage + Metrics> {
    chunks: E::Blob,
    indexes: [E::Blob; 2],

    /// Index blob receiving the next commit (the one holding the older
    /// version, or neither).
    next_index: usize,
    version: u64,

    /// Exposed slot count.
    slots: u64,
    /// Length of the chunk blob in chunk slots.
    chunk_slots: u64,
    /// Chunk number -> chunk blob slot.
    table: Vec<u64>,
    /// Chunk blob slots not referenced by the committed table.
    free: Vec<u64>,

    dirty: BTreeMap<u64, Vec<Digest>>,
    max_cache: usize,

    flushes: Counter,
}

impl<E: RStorage + Metrics> CowStore<E> {
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let (chunks, chunk_bytes) = context.open(&cfg.partition, CHUNK_BLOB).await?;
        let chunk_slots = chunk_bytes / CHUNK_BYTES;

        // load both index blobs and adopt the newest valid version
        let (index_0, size_0) = context.open(&cfg.partition, INDEX_BLOBS[0]).await?;
        let (index_1, size_1) = context.open(&cfg.partition, INDEX_BLOBS[1]).await?;
        let mut best: Option<(usize, u64, u64, Vec<u64>)> = None;
        let mut seen_data = false;
        for (i, (blob, size)) in [(&index_0, size_0), (&index_1, size_1)].into_iter().enumerate() {
            if size == 0 {
                continue;
            }
            seen_data = true;
            let bytes = blob.read_at(vec![0u8; size as usize], 0).await?;
            let Some((version, slots, table)) = Self::parse_index(bytes.as_ref()) else {
                warn!(blob = i, size, "discarding invalid chunk index");
                continue;
            };
            if table.iter().any(|slot| *slot != NO_SLOT && *slot >= chunk_slots) {
                warn!(blob = i, "discarding chunk index referencing missing chunks");
                continue;
            }
            if best.as_ref().map(|(_, v, _, _)| *v < version).unwrap_or(true) {
                best = Some((i, version, slots, table));
            }
        }
        if best.is_none() && seen_data {
            return Err(Error::CorruptChunkIndex);
        }
        let (next_index, version, slots, table) = match best {
            Some((i, version, slots, table)) => (1 - i, version, slots, table),
            None => (0, 0, 0, Vec::new()),
        };
        debug!(version, slots, chunk_slots, "loaded chunk index");

        // anything the committed table does not reference is reusable
        let referenced: BTreeSet<u64> = table.iter().copied().filter(|s| *s != NO_SLOT).collect();
        let free = (0..chunk_slots).filter(|s| !referenced.contains(s)).collect();

        let flushes = Counter::default();
        context.register("flushes", "Number of chunk flushes", flushes.clone());

        Ok(Self {
            chunks,
            indexes: [index_0, index_1],
            next_index,
            version,
            slots,
            chunk_slots,
            table,
            free,
            dirty: BTreeMap::new(),
            max_cache: cfg.max_cache,
            flushes,
        })
    }

    /// Parse an index blob: version, slot count, chunk table, CRC32.
    fn parse_index(bytes: &[u8]) -> Option<(u64, u64, Vec<u64>)> {
        if bytes.len() < 24 {
            return None;
        }
        let (payload, crc) = bytes.split_at(bytes.len() - 4);
        if crc32fast::hash(payload) != u32::from_be_bytes(crc.try_into().unwrap()) {
            return None;
        }
        let version = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let slots = u64::from_be_bytes(payload[8..16].try_into().unwrap());
        let count = u32::from_be_bytes(payload[16..20].try_into().unwrap()) as usize;
        if payload.len() != 20 + count * 8 || count as u64 != slots.div_ceil(CHUNK_HASHES) {
            return None;
        }
        let table = payload[20..]
            .chunks_exact(8)
            .map(|entry| u64::from_be_bytes(entry.try_into().unwrap()))
            .collect();
        Some((version, slots, table))
    }

    fn check(&self, pos: u64) -> Result<(), Error> {
        if pos >= self.slots {
            return Err(Error::OutOfBounds {
                pos,
                size: self.slots,
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.slots
    }

    pub async fn read(&self, pos: u64) -> Result<Digest, Error> {
        self.check(pos)?;
        let chunk_no = pos / CHUNK_HASHES;
        let offset = pos % CHUNK_HASHES;
        if let Some(chunk) = self.dirty.get(&chunk_no) {
            return Ok(chunk[offset as usize].clone());
        }
        let slot = self.table[chunk_no as usize];
        if slot == NO_SLOT {
            return Ok(empty());
        }
        let read = self
            .chunks
            .read_at(vec![0u8; SLOT_SIZE as usize], slot * CHUNK_BYTES + offset * SLOT_SIZE)
            .await?;
        let mut digest = [0u8; SLOT_SIZE as usize];
        digest.copy_from_slice(read.as_ref());
        Ok(Digest::from(digest))
    }

    pub async fn write(&mut self, pos: u64, digest: &Digest) -> Result<(), Error> {
        self.check(pos)?;
        let chunk_no = pos / CHUNK_HASHES;
        let offset = (pos % CHUNK_HASHES) as usize;
        if !self.dirty.contains_key(&chunk_no) {
            let chunk = self.load_chunk(chunk_no).await?;
            self.dirty.insert(chunk_no, chunk);
        }
        self.dirty.get_mut(&chunk_no).unwrap()[offset] = digest.clone();
        if self.dirty.len() * CHUNK_BYTES as usize > self.max_cache {
            self.flush().await?;
        }
        Ok(())
    }

    async fn load_chunk(&self, chunk_no: u64) -> Result<Vec<Digest>, Error> {
        let slot = self.table[chunk_no as usize];
        if slot == NO_SLOT {
            return Ok(vec![empty(); CHUNK_HASHES as usize]);
        }
        let read = self
            .chunks
            .read_at(vec![0u8; CHUNK_BYTES as usize], slot * CHUNK_BYTES)
            .await?;
        Ok(read
            .as_ref()
            .chunks_exact(SLOT_SIZE as usize)
            .map(|chunk| {
                let mut digest = [0u8; SLOT_SIZE as usize];
                digest.copy_from_slice(chunk);
                Digest::from(digest)
            })
            .collect())
    }

    pub async fn swap(&mut self, a: u64, b: u64) -> Result<(), Error> {
        let at_a = self.read(a).await?;
        let at_b = self.read(b).await?;
        self.write(a, &at_b).await?;
        self.write(b, &at_a).await?;
        Ok(())
    }

    pub async fn swap_range(&mut self, a: u64, b: u64, width: u64) -> Result<(), Error> {
        for i in 0..width {
            self.swap(a + i, b + i).await?;
        }
        Ok(())
    }

    /// Write all dirty chunks to free regions and commit a new index.
    async fn flush(&mut self) -> Result<(), Error> {
        let mut retired = Vec::new();
        let dirty = std::mem::take(&mut self.dirty);
        for (chunk_no, chunk) in dirty {
            let slot = match self.free.pop() {
                Some(slot) => slot,
                None => {
                    let slot = self.chunk_slots;
                    self.chunk_slots += 1;
                    slot
                }
            };
            let mut buf = Vec::with_capacity(CHUNK_BYTES as usize);
            for digest in &chunk {
                buf.extend_from_slice(digest.as_ref());
            }
            self.chunks.write_at(buf, slot * CHUNK_BYTES).await?;
            let old = std::mem::replace(&mut self.table[chunk_no as usize], slot);
            if old != NO_SLOT {
                retired.push(old);
            }
        }
        self.chunks.sync().await?;

        // commit the index to the older blob, then retire superseded slots
        self.version += 1;
        let mut buf = Vec::with_capacity(20 + self.table.len() * 8 + 4);
        buf.put_u64(self.version);
        buf.put_u64(self.slots);
        buf.put_u32(self.table.len() as u32);
        for slot in &self.table {
            buf.put_u64(*slot);
        }
        buf.put_u32(crc32fast::hash(&buf));
        let index = &self.indexes[self.next_index];
        index.resize(buf.len() as u64).await?;
        index.write_at(buf, 0).await?;
        index.sync().await?;
        self.next_index = 1 - self.next_index;
        self.free.extend(retired);
        self.flushes.inc();
        Ok(())
    }

    pub async fn resize(&mut self, slots: u64) -> Result<(), Error> {
        if slots < self.slots {
            return Err(Error::Shrink {
                from: self.slots,
                to: slots,
            });
        }
        // chunks materialize lazily; only the table needs to cover the range
        self.slots = slots;
        self.table.resize(slots.div_ceil(CHUNK_HASHES) as usize, NO_SLOT);
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), Error> {
        self.flush().await
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.flush().await?;
        self.chunks.close().await?;
        let [index_0, index_1] = self.indexes;
        index_0.close().await?;
        index_1.close().await?;
        Ok(())
    }
}
