//! marketlab-store — filesystem stores, the dataset registry, ingestion,
//! and the fingerprint-keyed market data cache.
//!
//! Immutability guarantees live here: raw payloads are write-once,
//! canonical snapshots become visible through one atomic rename, and the
//! registry accepts an entry only after re-verifying the snapshot's
//! content hash on disk. The cache service serves aligned views rebuilt
//! from persisted partitions so cache hits and misses are
//! indistinguishable.

pub mod layout;
pub mod manifest;
pub mod market;
pub mod parts;
pub mod pipeline;
pub mod registry;
pub mod runs;
pub mod service;
pub mod snapshot;

pub use marketlab_core::error::{DataError, ErrorKind, Result};
