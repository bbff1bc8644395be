//! Backend keeping every hash slot in a contiguous in-memory vector.

use super::Error;
use crate::hasher::empty;
use commonware_cryptography::sha256::Digest;

/// In-memory backend. The fastest option, at the cost of holding the whole
/// forest resident; also the only backend whose contents can be dumped
/// verbatim to a blob for later restoration.
#[derive(Default)]
pub struct MemStore {
    hashes: Vec<Digest>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a dumped slot array.
    pub(crate) fn from_digests(hashes: Vec<Digest>) -> Self {
        Self { hashes }
    }

    /// The raw slot array.
    pub(crate) fn digests(&self) -> &[Digest] {
        &self.hashes
    }

    fn check(&self, pos: u64) -> Result<usize, Error> {
        if pos >= self.size() {
            return Err(Error::OutOfBounds {
                pos,
                size: self.size(),
            });
        }
        Ok(pos as usize)
    }

    pub fn size(&self) -> u64 {
        self.hashes.len() as u64
    }

    pub fn read(&self, pos: u64) -> Result<Digest, Error> {
        let pos = self.check(pos)?;
        Ok(self.hashes[pos].clone())
    }

    pub fn write(&mut self, pos: u64, digest: &Digest) -> Result<(), Error> {
        let pos = self.check(pos)?;
        self.hashes[pos] = digest.clone();
        Ok(())
    }

    pub fn swap(&mut self, a: u64, b: u64) -> Result<(), Error> {
        let a = self.check(a)?;
        let b = self.check(b)?;
        self.hashes.swap(a, b);
        Ok(())
    }

    pub fn swap_range(&mut self, a: u64, b: u64, width: u64) -> Result<(), Error> {
        if width == 0 {
            return Ok(());
        }
        self.check(a + width - 1)?;
        self.check(b + width - 1)?;
        let (a, b, width) = (a as usize, b as usize, width as usize);
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.hashes.split_at_mut(high);
        head[low..low + width].swap_with_slice(&mut tail[..width]);
        Ok(())
    }

    pub fn resize(&mut self, slots: u64) -> Result<(), Error> {
        if slots < self.size() {
            return Err(Error::Shrink {
                from: self.size(),
                to: slots,
            });
        }
        self.hashes.resize(slots as usize, empty());
        Ok(())
    }
}
