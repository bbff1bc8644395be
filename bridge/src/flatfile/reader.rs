//! Random-access read side of the proof store.

use super::{Error, HEADER_SIZE, MAGIC, MAX_PAYLOAD, OFFSET_BLOB, PROOF_BLOB};
use commonware_runtime::{Blob, Storage as RStorage};

/// Validating random-access reader over a proof store, indexed by block
/// height.
///
/// A [Reader] snapshots the store's extent when opened: records appended by
/// a live writer afterwards are not visible. Open it against a synced store
/// (archive serving is the intended use).
pub struct Reader<E: RStorage> {
    proofs: E::Blob,
    offsets: E::Blob,
    heights: u64,
    proof_size: u64,
}

impl<E: RStorage> Reader<E> {
    pub async fn init(context: E, partition: &str) -> Result<Self, Error> {
        let (proofs, proof_size) = context.open(partition, PROOF_BLOB).await?;
        let (offsets, offset_size) = context.open(partition, OFFSET_BLOB).await?;
        if offset_size % 8 != 0 {
            return Err(Error::CorruptOffsetFile(offset_size));
        }
        Ok(Self {
            proofs,
            offsets,
            heights: offset_size / 8,
            proof_size,
        })
    }

    /// Number of heights with a stored record.
    pub fn heights(&self) -> u64 {
        self.heights
    }

    /// Read the proof payload for `height`, validating the record frame
    /// before allocating for it.
    pub async fn get(&self, height: u64) -> Result<Vec<u8>, Error> {
        if height >= self.heights {
            return Err(Error::UnknownHeight(height));
        }
        let read = self.offsets.read_at(vec![0u8; 8], height * 8).await?;
        let start = u64::from_be_bytes(read.as_ref().try_into().unwrap());
        if start + HEADER_SIZE > self.proof_size {
            return Err(Error::TornProofFile);
        }

        let header = self.proofs.read_at(vec![0u8; HEADER_SIZE as usize], start).await?;
        let header = header.as_ref();
        if header[0..4] != MAGIC {
            return Err(Error::BadMagic(height));
        }
        let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
        if len >= MAX_PAYLOAD {
            return Err(Error::OversizedRecord(len));
        }
        if start + HEADER_SIZE + len as u64 > self.proof_size {
            return Err(Error::TornProofFile);
        }

        let payload = self.proofs.read_at(vec![0u8; len as usize], start + HEADER_SIZE).await?;
        Ok(payload.as_ref().to_vec())
    }

    pub async fn close(self) -> Result<(), Error> {
        self.proofs.close().await?;
        self.offsets.close().await?;
        Ok(())
    }
}
