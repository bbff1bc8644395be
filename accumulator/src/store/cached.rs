//! Flat-blob backend with the top rows of the tree cached in memory.
//!
//! Every modification of the forest rewrites hashes near the top of the
//! enclosing tree, so those rows are by far the hottest slots. Under the
//! bottom-left-to-top numbering the top `K` rows are simply the last
//! `(2^K) - 1` positions of the slot array, which makes the position-to-cache
//! mapping a single subtraction.
//!
//! The cache is a validity flag per cached slot plus a dense digest array.
//! Reads check the cache first and populate it on miss; writes to cached
//! positions never touch the blob until the cache is flushed (on sync,
//! resize, and close). On resize the cache window moves, so the flags are
//! cleared after flushing at the old positions.

use super::{Error, SLOT_SIZE};
use crate::hasher::empty;
use commonware_cryptography::sha256::Digest;
use commonware_runtime::{Blob, Metrics, Storage as RStorage};
use prometheus_client::metrics::counter::Counter;
use tracing::{debug, warn};

const BLOB_NAME: &[u8] = b"forest";

/// Configuration for [CachedStore].
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition holding the slot blob.
    pub partition: String,

    /// Number of top rows of the tree to cache, i.e. `(2^cached_rows) - 1`
    /// slots once the forest has grown past that size.
    pub cached_rows: u8,
}

/// Flat-blob backend with a top-of-tree cache. Shares its on-disk layout with
/// [super::DiskStore].
pub struct CachedStore<E: RStorage + Metrics> {
    blob: E::Blob,
    slots: u64,
    cached_rows: u8,

    /// First position inside the cache window (`slots - window`).
    cache_start: u64,
    valid: Vec<bool>,
    data: Vec<Digest>,

    hits: Counter,
    misses: Counter,
}

impl<E: RStorage + Metrics> CachedStore<E> {
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let (blob, size) = context.open(&cfg.partition, BLOB_NAME).await?;
        let slots = size / SLOT_SIZE;
        if size % SLOT_SIZE != 0 {
            warn!(size, "slot blob not 32-byte aligned, truncating");
            blob.resize(slots * SLOT_SIZE).await?;
        }
        let window = Self::window(slots, cfg.cached_rows);
        debug!(slots, window, "loaded forest blob");

        let hits = Counter::default();
        let misses = Counter::default();
        context.register("cache_hits", "Number of cache hits", hits.clone());
        context.register("cache_misses", "Number of cache misses", misses.clone());

        Ok(Self {
            blob,
            slots,
            cached_rows: cfg.cached_rows,
            cache_start: slots - window,
            valid: vec![false; window as usize],
            data: vec![empty(); window as usize],
            hits,
            misses,
        })
    }

    /// Number of cached slots for a store of `slots` slots: the top
    /// `cached_rows` rows, or everything while the store is still smaller.
    fn window(slots: u64, cached_rows: u8) -> u64 {
        std::cmp::min((1u64 << cached_rows) - 1, slots)
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

    pub async fn read(&mut self, pos: u64) -> Result<Digest, Error> {
        self.check(pos)?;
        if pos < self.cache_start {
            return self.read_blob(pos).await;
        }
        let index = (pos - self.cache_start) as usize;
        if self.valid[index] {
            self.hits.inc();
            return Ok(self.data[index].clone());
        }
        // miss: fall through to the blob and keep the value (this is also
        // how the cache warms back up after a restore)
        self.misses.inc();
        let digest = self.read_blob(pos).await?;
        self.valid[index] = true;
        self.data[index] = digest.clone();
        Ok(digest)
    }

    pub async fn write(&mut self, pos: u64, digest: &Digest) -> Result<(), Error> {
        self.check(pos)?;
        if pos < self.cache_start {
            self.blob.write_at(digest.as_ref().to_vec(), pos * SLOT_SIZE).await?;
            return Ok(());
        }
        let index = (pos - self.cache_start) as usize;
        self.valid[index] = true;
        self.data[index] = digest.clone();
        Ok(())
    }

    async fn read_blob(&self, pos: u64) -> Result<Digest, Error> {
        let read = self.blob.read_at(vec![0u8; SLOT_SIZE as usize], pos * SLOT_SIZE).await?;
        let mut digest = [0u8; SLOT_SIZE as usize];
        digest.copy_from_slice(read.as_ref());
        Ok(Digest::from(digest))
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

    /// Write every populated cache slot through to the blob.
    async fn flush(&mut self) -> Result<(), Error> {
        for (index, valid) in self.valid.iter().enumerate() {
            if !valid {
                continue;
            }
            let pos = self.cache_start + index as u64;
            self.blob
                .write_at(self.data[index].as_ref().to_vec(), pos * SLOT_SIZE)
                .await?;
        }
        Ok(())
    }

    pub async fn resize(&mut self, slots: u64) -> Result<(), Error> {
        if slots < self.slots {
            return Err(Error::Shrink {
                from: self.slots,
                to: slots,
            });
        }
        // the window moves with the top of the tree, so settle the cache at
        // its current positions first
        self.flush().await?;
        self.blob.resize(slots * SLOT_SIZE).await?;
        self.slots = slots;
        let window = Self::window(slots, self.cached_rows);
        self.cache_start = slots - window;
        self.valid = vec![false; window as usize];
        self.data = vec![empty(); window as usize];
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), Error> {
        self.flush().await?;
        self.blob.sync().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.flush().await?;
        self.blob.sync().await?;
        self.blob.close().await?;
        Ok(())
    }
}
