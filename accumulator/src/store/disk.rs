//! Backend keeping every hash slot in a single flat blob.

use super::{Error, SLOT_SIZE};
use commonware_cryptography::sha256::Digest;
use commonware_runtime::{Blob, Metrics, Storage as RStorage};
use prometheus_client::metrics::counter::Counter;
use tracing::{debug, warn};

/// Name of the blob holding the slot array within the configured partition.
const BLOB_NAME: &[u8] = b"forest";

/// Number of slots moved per I/O operation when swapping ranges.
const SWAP_CHUNK: u64 = 1 << 15;

/// Configuration for [DiskStore].
#[derive(Clone)]
pub struct Config {
    /// The `commonware-runtime::Storage` partition holding the slot blob.
    pub partition: String,
}

/// Flat-blob backend: slot `p` occupies bytes `[32p, 32p+32)`. Slots inside a
/// sparse (never-written) region read as `EMPTY`.
pub struct DiskStore<E: RStorage + Metrics> {
    blob: E::Blob,
    slots: u64,

    reads: Counter,
    writes: Counter,
}

impl<E: RStorage + Metrics> DiskStore<E> {
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let (blob, size) = context.open(&cfg.partition, BLOB_NAME).await?;
        let slots = size / SLOT_SIZE;
        if size % SLOT_SIZE != 0 {
            warn!(size, "slot blob not 32-byte aligned, truncating");
            blob.resize(slots * SLOT_SIZE).await?;
        }
        debug!(slots, "loaded forest blob");

        let reads = Counter::default();
        let writes = Counter::default();
        context.register("reads", "Number of slot reads", reads.clone());
        context.register("writes", "Number of slot writes", writes.clone());

        Ok(Self {
            blob,
            slots,
            reads,
            writes,
        })
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
        self.reads.inc();
        let read = self.blob.read_at(vec![0u8; SLOT_SIZE as usize], pos * SLOT_SIZE).await?;
        let mut digest = [0u8; SLOT_SIZE as usize];
        digest.copy_from_slice(read.as_ref());
        Ok(Digest::from(digest))
    }

    pub async fn write(&mut self, pos: u64, digest: &Digest) -> Result<(), Error> {
        self.check(pos)?;
        self.writes.inc();
        self.blob.write_at(digest.as_ref().to_vec(), pos * SLOT_SIZE).await?;
        Ok(())
    }

    pub async fn swap(&mut self, a: u64, b: u64) -> Result<(), Error> {
        let at_a = self.read(a).await?;
        let at_b = self.read(b).await?;
        self.write(a, &at_b).await?;
        self.write(b, &at_a).await?;
        Ok(())
    }

    pub async fn swap_range(&mut self, a: u64, b: u64, width: u64) -> Result<(), Error> {
        if width == 0 {
            return Ok(());
        }
        self.check(a + width - 1)?;
        self.check(b + width - 1)?;
        let mut moved = 0;
        while moved < width {
            let count = std::cmp::min(SWAP_CHUNK, width - moved);
            let bytes = (count * SLOT_SIZE) as usize;
            let a_off = (a + moved) * SLOT_SIZE;
            let b_off = (b + moved) * SLOT_SIZE;
            let a_range = self.blob.read_at(vec![0u8; bytes], a_off).await?;
            let b_range = self.blob.read_at(vec![0u8; bytes], b_off).await?;
            self.blob.write_at(a_range.as_ref().to_vec(), b_off).await?;
            self.blob.write_at(b_range.as_ref().to_vec(), a_off).await?;
            self.reads.inc_by(count);
            self.writes.inc_by(count);
            moved += count;
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
        self.blob.resize(slots * SLOT_SIZE).await?;
        self.slots = slots;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), Error> {
        self.blob.sync().await?;
        Ok(())
    }

    pub async fn close(self) -> Result<(), Error> {
        self.blob.close().await?;
        Ok(())
    }
}
