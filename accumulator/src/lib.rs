//! A hash-based dynamic accumulator (a "utreexo" forest) committing to a
//! cryptocurrency UTXO set.
//!
//! The accumulator is a set of perfect binary Merkle trees whose root tuple
//! commits to a growing-and-shrinking set of 32-byte leaves. A bridge node
//! maintains the full forest and serves membership proofs; lightweight
//! clients verify those proofs against the roots alone. Storage is pluggable
//! across four backends (memory, flat file, flat file with a top-of-tree
//! cache, and a copy-on-write chunked layout) with identical semantics.
//!
//! # Example
//!
//! ```rust
//! use commonware_cryptography::hash;
//! use commonware_runtime::{deterministic, Runner};
//! use utreexo_accumulator::{store, Config, Forest, Leaf};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let mut forest = Forest::init(
//!         context,
//!         Config {
//!             partition: "forest".to_string(),
//!             store: store::Config::Mem,
//!         },
//!     )
//!     .await
//!     .unwrap();
//!
//!     // accumulate two leaves, then spend one
//!     let leaves: Vec<Leaf> = (0u8..2).map(|i| Leaf::new(hash(&[i]), false)).collect();
//!     forest.modify(&leaves, &[]).await.unwrap();
//!     forest.modify(&[], &[0]).await.unwrap();
//!
//!     // prove the survivor against the current roots
//!     let proof = forest.prove(&[leaves[1].hash.clone()]).await.unwrap();
//!     let roots = forest.roots().await.unwrap();
//!     proof.verify(&roots).unwrap();
//! });
//! ```

pub mod forest;
pub mod hasher;
pub mod position;
pub mod store;

pub use forest::{Config, Error, Forest, Leaf, Proof, UndoBlock};
