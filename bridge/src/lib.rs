//! Bridge-node storage for a utreexo accumulator: per-block membership
//! proofs in an append-ordered flat file, with UTXO time-to-live values
//! patched in place once later blocks reveal them.
//!
//! The accumulator engine lives in `utreexo-accumulator`; this crate
//! persists what it emits. See [flatfile] for the file format and the
//! single-writer discipline.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use commonware_runtime::{deterministic, Runner};
//! use utreexo_bridge::flatfile::{Config, FlatFile, Reader, TtlBlock, TtlEntry};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let cfg = Config {
//!         partition: "proofs".to_string(),
//!         ttl_prefix: 8,
//!         proof_backlog: 64,
//!         ttl_backlog: 64,
//!         offset_backlog: 1024,
//!     };
//!     let mut file = FlatFile::init(context.clone(), cfg).await.unwrap();
//!
//!     // persist two blocks' proofs, then learn that block 1 spent an
//!     // output created in block 0
//!     file.append(0, Bytes::from(vec![0u8; 64]), 4).await.unwrap();
//!     file.append(1, Bytes::from(vec![0u8; 64]), 4).await.unwrap();
//!     file.patch(TtlBlock {
//!         height: 1,
//!         entries: vec![TtlEntry { create_height: 0, index_within_block: 2 }],
//!     })
//!     .await
//!     .unwrap();
//!     file.close().await.unwrap();
//!
//!     // serve it back
//!     let reader = Reader::init(context, "proofs").await.unwrap();
//!     let payload = reader.get(0).await.unwrap();
//!     assert_eq!(&payload[16..20], &1u32.to_be_bytes());
//! });
//! ```

pub mod flatfile;

pub use flatfile::{Config, Error, FlatFile, Reader, TtlBlock, TtlEntry};
