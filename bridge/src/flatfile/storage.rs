//! Implementation of the two cooperating flat-file writer tasks.

use super::{Config, Error, HEADER_SIZE, MAGIC, MAX_PAYLOAD, OFFSET_BLOB, PROOF_BLOB};
use bytes::{BufMut, Bytes};
use commonware_macros::select;
use commonware_runtime::{Blob, Handle, Metrics, Spawner, Storage as RStorage};
use futures::{channel::mpsc, SinkExt, StreamExt};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use tracing::{debug, error, trace, warn};

/// One proof append: a block height, its serialized proof payload, and the
/// number of reserved TTL slots inside the payload.
struct Record {
    height: u64,
    payload: Bytes,
    ttl_slots: u32,
}

/// One TTL to patch: the height that created the output and the output's
/// index within that block's slot region.
#[derive(Clone, Debug)]
pub struct TtlEntry {
    pub create_height: u64,
    pub index_within_block: u32,
}

/// All TTLs learned from one block: every entry is patched with
/// `height - create_height`.
#[derive(Clone, Debug)]
pub struct TtlBlock {
    pub height: u64,
    pub entries: Vec<TtlEntry>,
}

/// Handle over the proof/TTL writer pair.
///
/// [FlatFile::init] spawns both tasks. [FlatFile::append] feeds the proof
/// task and [FlatFile::patch] the TTL task; both only enqueue, and any
/// failure inside a task is fatal to it and surfaces from
/// [FlatFile::close]. Losing a writer is fatal to the pipeline by design:
/// there is no way to skip a block and keep the height-indexed layout
/// consistent.
pub struct FlatFile {
    resume_height: u64,
    records: mpsc::Sender<Record>,
    ttls: mpsc::Sender<TtlBlock>,
    proof_handle: Handle<Result<(), Error>>,
    ttl_handle: Handle<Result<(), Error>>,
}

impl FlatFile {
    /// Open the proof and offset blobs, replay the offset index, validate
    /// the tail frame, and spawn the writer pair.
    pub async fn init<E: RStorage + Metrics + Spawner>(
        context: E,
        cfg: Config,
    ) -> Result<Self, Error> {
        let (proofs, proof_size) = context.open(&cfg.partition, PROOF_BLOB).await?;
        let (offsets, offset_size) = context.open(&cfg.partition, OFFSET_BLOB).await?;
        if offset_size % 8 != 0 {
            return Err(Error::CorruptOffsetFile(offset_size));
        }
        let resume_height = offset_size / 8;

        // replay the offset index (it seeds the TTL task) and check that its
        // last entry frames a complete record ending exactly at the blob's
        // length -- a mismatch means a torn shutdown
        let mut in_ram_offsets = Vec::with_capacity(resume_height as usize);
        if resume_height > 0 {
            let read = offsets.read_at(vec![0u8; offset_size as usize], 0).await?;
            for entry in read.as_ref().chunks_exact(8) {
                in_ram_offsets.push(u64::from_be_bytes(entry.try_into().unwrap()));
            }
            let last = *in_ram_offsets.last().unwrap();
            if last + HEADER_SIZE > proof_size {
                return Err(Error::TornProofFile);
            }
            let header = proofs.read_at(vec![0u8; HEADER_SIZE as usize], last).await?;
            let header = header.as_ref();
            if header[0..4] != MAGIC {
                return Err(Error::TornProofFile);
            }
            let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
            if last + HEADER_SIZE + len as u64 != proof_size {
                return Err(Error::TornProofFile);
            }
        } else if proof_size != 0 {
            return Err(Error::TornProofFile);
        }
        debug!(resume_height, proof_size, "replayed offset index");

        let written = Counter::default();
        let patched = Counter::default();
        let height = Gauge::default();
        context.register("proofs_written", "Number of proof records written", written.clone());
        context.register("ttls_patched", "Number of ttl slots patched", patched.clone());
        context.register("height", "Next block height to persist", height.clone());
        height.set(resume_height as i64);

        let (records_tx, records_rx) = mpsc::channel(cfg.proof_backlog);
        let (ttls_tx, ttls_rx) = mpsc::channel(cfg.ttl_backlog);
        let (offsets_tx, offsets_rx) = mpsc::channel(cfg.offset_backlog);

        let proof_handle = {
            let proofs = proofs.clone();
            context.with_label("proofs").spawn(move |_| async move {
                let result = run_proofs(
                    proofs,
                    offsets,
                    proof_size,
                    resume_height,
                    cfg.ttl_prefix,
                    records_rx,
                    offsets_tx,
                    written,
                    height,
                )
                .await;
                if let Err(err) = &result {
                    error!(?err, "proof writer failed");
                }
                result
            })
        };
        let ttl_handle = {
            let ttl_prefix = cfg.ttl_prefix;
            context.with_label("ttls").spawn(move |_| async move {
                let result =
                    run_ttls(proofs, in_ram_offsets, ttl_prefix, offsets_rx, ttls_rx, patched).await;
                if let Err(err) = &result {
                    error!(?err, "ttl writer failed");
                }
                result
            })
        };

        Ok(Self {
            resume_height,
            records: records_tx,
            ttls: ttls_tx,
            proof_handle,
            ttl_handle,
        })
    }

    /// Height the proof stream resumed at: the next append must carry it.
    pub fn resume_height(&self) -> u64 {
        self.resume_height
    }

    /// Enqueue the proof payload for `height`. Payloads must already contain
    /// their zeroed TTL slot region.
    pub async fn append(&mut self, height: u64, payload: Bytes, ttl_slots: u32) -> Result<(), Error> {
        self.records
            .send(Record {
                height,
                payload,
                ttl_slots,
            })
            .await
            .map_err(|_| Error::Stopped)
    }

    /// Enqueue one block's TTL results for back-patching.
    pub async fn patch(&mut self, block: TtlBlock) -> Result<(), Error> {
        self.ttls.send(block).await.map_err(|_| Error::Stopped)
    }

    /// Stop both writers, flushing and closing the blobs. Surfaces the first
    /// task failure, if any.
    pub async fn close(self) -> Result<(), Error> {
        drop(self.records);
        drop(self.ttls);
        self.proof_handle.await.map_err(Error::Runtime)??;
        self.ttl_handle.await.map_err(Error::Runtime)??;
        Ok(())
    }
}

/// The proof task: sole appender of the proof blob and sole writer of the
/// offset blob.
#[allow(clippy::too_many_arguments)]
async fn run_proofs<B: Blob>(
    proofs: B,
    offsets: B,
    mut cur_offset: u64,
    mut next_height: u64,
    ttl_prefix: u32,
    mut records: mpsc::Receiver<Record>,
    mut published: mpsc::Sender<(u64, u64)>,
    written: Counter,
    height: Gauge,
) -> Result<(), Error> {
    let mut ttls_gone = false;
    while let Some(record) = records.next().await {
        if record.height != next_height {
            return Err(Error::OutOfOrder {
                height: record.height,
                next: next_height,
            });
        }
        let len = record.payload.len();
        if len as u64 >= MAX_PAYLOAD as u64 {
            return Err(Error::OversizedRecord(len as u32));
        }
        if (len as u64) < ttl_prefix as u64 + 4 * record.ttl_slots as u64 {
            return Err(Error::ShortPayload {
                len,
                slots: record.ttl_slots,
                prefix: ttl_prefix,
            });
        }

        // offset entry first, then the framed record behind it
        offsets
            .write_at(cur_offset.to_be_bytes().to_vec(), record.height * 8)
            .await?;
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize + len);
        buf.extend_from_slice(&MAGIC);
        buf.put_u32(len as u32);
        buf.extend_from_slice(&record.payload);
        proofs.write_at(buf, cur_offset).await?;

        let start = cur_offset;
        cur_offset += HEADER_SIZE + len as u64;
        next_height += 1;
        written.inc();
        height.set(next_height as i64);
        trace!(height = record.height, start, len, "wrote proof");

        // the record is durable in order; only now may the TTL task patch it
        if !ttls_gone && published.send((record.height, start)).await.is_err() {
            warn!("ttl writer gone, continuing without patches");
            ttls_gone = true;
        }
    }

    // graceful shutdown: settle the proof blob before the offset index that
    // points into it
    proofs.sync().await?;
    offsets.sync().await?;
    proofs.close().await?;
    offsets.close().await?;
    Ok(())
}

/// The TTL task: sole in-place patcher of the proof blob.
async fn run_ttls<B: Blob>(
    proofs: B,
    mut in_ram_offsets: Vec<u64>,
    ttl_prefix: u32,
    mut published: mpsc::Receiver<(u64, u64)>,
    mut ttls: mpsc::Receiver<TtlBlock>,
    patched: Counter,
) -> Result<(), Error> {
    let mut publishing = true;
    loop {
        let block = if publishing {
            // drain offsets eagerly so the proof task never stalls on a full
            // offset queue
            select! {
                offset = published.next() => {
                    match offset {
                        Some((height, start)) => {
                            record_offset(&mut in_ram_offsets, height, start);
                            continue;
                        }
                        None => {
                            publishing = false;
                            continue;
                        }
                    }
                },
                block = ttls.next() => { block },
            }
        } else {
            ttls.next().await
        };
        let Some(block) = block else {
            break;
        };

        // wait for every offset this block patches into (a result can outrun
        // the proof stream)
        if let Some(needed) = block.entries.iter().map(|e| e.create_height).max() {
            while (in_ram_offsets.len() as u64) <= needed {
                match published.next().await {
                    Some((height, start)) => record_offset(&mut in_ram_offsets, height, start),
                    None => return Err(Error::UnknownHeight(needed)),
                }
            }
        }

        for entry in &block.entries {
            if entry.create_height > block.height {
                return Err(Error::UnknownHeight(entry.create_height));
            }
            let target = in_ram_offsets[entry.create_height as usize]
                + HEADER_SIZE
                + ttl_prefix as u64
                + 4 * entry.index_within_block as u64;
            // lifespans at the never-spends threshold are filtered upstream
            debug_assert!(block.height - entry.create_height < (1 << 31) - 48);
            let ttl = (block.height - entry.create_height) as u32;
            proofs.write_at(ttl.to_be_bytes().to_vec(), target).await?;
            patched.inc();
        }
        trace!(height = block.height, entries = block.entries.len(), "patched ttls");
    }

    proofs.sync().await?;
    proofs.close().await?;
    Ok(())
}

fn record_offset(in_ram_offsets: &mut Vec<u64>, height: u64, start: u64) {
    debug_assert_eq!(height, in_ram_offsets.len() as u64);
    in_ram_offsets.push(start);
}
