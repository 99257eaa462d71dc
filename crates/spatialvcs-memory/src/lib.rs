//! `spatialvcs-memory` – semantic memory of what was seen, and where.
//!
//! # Modules
//!
//! - [`store`] – [`SpatialMemory`][store::SpatialMemory]: lazily initialised,
//!   mutex-guarded store with scan-scoped similarity search and a sticky
//!   degraded mode.
//! - [`index`] – [`SqliteIndex`][index::SqliteIndex]: the persistent vector
//!   index behind the store, one SQLite table per collection.
//! - [`embedding`] – the [`Embedder`][embedding::Embedder] seam with a hash
//!   embedder and, behind `fastembed-embeddings`, all-MiniLM-L6-v2.
//! - [`metadata`] – scalar coercion of metadata on the way into the index
//!   and back.
//! - [`config`] – [`MemoryConfig`][config::MemoryConfig].

pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod metadata;
pub mod store;

pub use config::MemoryConfig;
pub use embedding::{EMBEDDING_DIM, Embedder, HashEmbedder};
pub use error::MemoryError;
pub use store::{AddOutcome, MemoryRecord, SearchHit, SpatialMemory, StoreStatus};
