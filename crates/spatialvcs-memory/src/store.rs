//! Spatial Memory Store.
//!
//! Durable, queryable memory of observations.  A [`SpatialMemory`] starts
//! *uninitialised* and builds its embedder and vector index on first use.  If
//! either cannot be built the store becomes *degraded* for the rest of its
//! life: writes are skipped (with one warning), searches return nothing, and
//! only [`SpatialMemory::reset_database`] retries construction.
//!
//! One mutex covers the whole embed → index write → mirror append sequence,
//! and every read goes through the same lock.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use spatialvcs_memory::store::SpatialMemory;
//!
//! let memory = SpatialMemory::in_memory();
//! let meta = json!({"scan_id": "s1", "label": "cup"});
//! memory
//!     .add_observation("red mug on the desk", meta.as_object().unwrap())
//!     .unwrap();
//!
//! let hits = memory.search("mug", 1, Some("s1")).unwrap();
//! assert_eq!(hits.len(), 1);
//! assert!(memory.search("mug", 1, Some("s2")).unwrap().is_empty());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use spatialvcs_types::Metadata;
use tracing::{debug, info, instrument, warn};

use crate::config::MemoryConfig;
use crate::embedding::{Embedder, HashEmbedder, default_embedder};
use crate::error::MemoryError;
use crate::index::{SqliteIndex, VectorIndex};
use crate::metadata::{ScalarValue, from_scalar_map, to_scalar_map};

/// Results returned by [`SpatialMemory::search`] when `k` is not given.
pub const DEFAULT_K: usize = 3;

/// Over-fetch multiplier for scan-scoped searches.
const SCOPED_FETCH_FACTOR: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Factories
// ─────────────────────────────────────────────────────────────────────────────

pub type EmbedderResult = Result<Box<dyn Embedder>, MemoryError>;
pub type IndexResult = Result<Box<dyn VectorIndex>, MemoryError>;

/// Builds the embedder on first use.
pub type EmbedderFactory = Box<dyn Fn() -> EmbedderResult + Send + Sync>;

/// Builds the vector index on first use.
pub type IndexFactory = Box<dyn Fn(&MemoryConfig) -> IndexResult + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Records & outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Uninitialized,
    Ready,
    Degraded,
}

/// What [`SpatialMemory::add_observation`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Written to the index under `id`.
    Stored { id: String },
    /// The store is degraded; nothing was written.
    NotReady,
}

/// One stored observation, as kept in the in-memory mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// `1 / (1 + distance)`: `1.0` for an identical vector.
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

/// Map a raw index distance to a similarity score in `(0, 1]`.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

// ─────────────────────────────────────────────────────────────────────────────
// SpatialMemory
// ─────────────────────────────────────────────────────────────────────────────

struct Backend {
    embedder: Box<dyn Embedder>,
    index: Box<dyn VectorIndex>,
}

struct State {
    status: StoreStatus,
    backend: Option<Backend>,
    mirror: Vec<MemoryRecord>,
    next_id: u64,
}

/// Semantic memory of observations, scoped by `scan_id`.
pub struct SpatialMemory {
    config: MemoryConfig,
    make_embedder: EmbedderFactory,
    make_index: IndexFactory,
    state: Mutex<State>,
    warned_not_ready: AtomicBool,
}

impl SpatialMemory {
    /// A store persisted under `config.persist_dir`, using the best embedder
    /// this build offers.
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_factories(
            config,
            Box::new(default_embedder),
            Box::new(|cfg: &MemoryConfig| -> IndexResult {
                Ok(Box::new(SqliteIndex::open(
                    &cfg.database_path(),
                    &cfg.collection,
                    cfg.dimensions,
                )?))
            }),
        )
    }

    /// A throwaway store: hash embeddings in an in-memory index.
    pub fn in_memory() -> Self {
        Self::with_factories(
            MemoryConfig::default(),
            Box::new(|| -> EmbedderResult { Ok(Box::new(HashEmbedder::new())) }),
            Box::new(|cfg: &MemoryConfig| -> IndexResult {
                Ok(Box::new(SqliteIndex::open_in_memory(
                    &cfg.collection,
                    cfg.dimensions,
                )?))
            }),
        )
    }

    /// A store with caller-supplied construction of its two resources.
    pub fn with_factories(
        config: MemoryConfig,
        make_embedder: EmbedderFactory,
        make_index: IndexFactory,
    ) -> Self {
        Self {
            config,
            make_embedder,
            make_index,
            state: Mutex::new(State {
                status: StoreStatus::Uninitialized,
                backend: None,
                mirror: Vec::new(),
                next_id: 0,
            }),
            warned_not_ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_backend(&self) -> Result<Backend, MemoryError> {
        let embedder = (self.make_embedder)()?;
        if embedder.dimensions() != self.config.dimensions {
            return Err(MemoryError::DimensionMismatch {
                expected: self.config.dimensions,
                got: embedder.dimensions(),
            });
        }
        let index = (self.make_index)(&self.config)?;
        Ok(Backend { embedder, index })
    }

    /// Lazy construction; a no-op once the store left `Uninitialized`.
    fn ensure_init(&self, state: &mut State) {
        if state.status != StoreStatus::Uninitialized {
            return;
        }
        match self.build_backend() {
            Ok(backend) => {
                match backend.index.snapshot() {
                    Ok(records) => {
                        state.mirror = records
                            .into_iter()
                            .map(|r| MemoryRecord {
                                id: r.id,
                                text: r.document,
                                metadata: from_scalar_map(r.metadata),
                            })
                            .collect();
                        state.next_id = state.mirror.len() as u64;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to warm memory mirror");
                        state.mirror.clear();
                        state.next_id = backend.index.count().unwrap_or(0) as u64;
                    }
                }
                info!(
                    collection = %self.config.collection,
                    records = state.mirror.len(),
                    "spatial memory ready"
                );
                state.backend = Some(backend);
                state.status = StoreStatus::Ready;
            }
            Err(e) => {
                warn!(error = %e, "spatial memory unavailable; running degraded");
                state.backend = None;
                state.status = StoreStatus::Degraded;
            }
        }
    }

    /// True when both the embedder and the index are available.
    ///
    /// Triggers lazy initialisation.
    pub fn is_ready(&self) -> bool {
        let mut state = self.lock();
        self.ensure_init(&mut state);
        state.backend.is_some()
    }

    /// Current lifecycle state, without forcing initialisation.
    pub fn status(&self) -> StoreStatus {
        self.lock().status
    }

    /// Store one observation.
    ///
    /// Structured metadata values are JSON-encoded for the index and decoded
    /// again by [`search`][Self::search].  Include a `scan_id` field for
    /// scoped retrieval to find the record.
    #[instrument(level = "debug", skip(self, text, metadata), fields(text_len = text.len()))]
    pub fn add_observation(
        &self,
        text: &str,
        metadata: &Metadata,
    ) -> Result<AddOutcome, MemoryError> {
        let mut guard = self.lock();
        self.ensure_init(&mut guard);
        let state = &mut *guard;
        let Some(backend) = state.backend.as_mut() else {
            if !self.warned_not_ready.swap(true, Ordering::Relaxed) {
                warn!("cannot add observation: memory store not ready (further warnings suppressed)");
            }
            return Ok(AddOutcome::NotReady);
        };

        let embedding = backend.embedder.embed(text)?;
        let id = format!("obs_{}", state.next_id);
        backend
            .index
            .add(&id, text, &embedding, &to_scalar_map(metadata))?;
        state.next_id += 1;
        state.mirror.push(MemoryRecord {
            id: id.clone(),
            text: text.to_string(),
            metadata: metadata.clone(),
        });
        debug!(%id, "observation stored");
        Ok(AddOutcome::Stored { id })
    }

    /// Up to `k` observations nearest to `query`, best first.
    ///
    /// With `scan_id`, only records whose metadata `scan_id` equals it are
    /// returned.  The index is not partitioned by scan, so the query
    /// over-fetches `k × 10` candidates and filters them here; a scan whose
    /// records all rank below that window yields fewer than `k` hits.
    #[instrument(level = "debug", skip(self))]
    pub fn search(
        &self,
        query: &str,
        k: usize,
        scan_id: Option<&str>,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let mut state = self.lock();
        self.ensure_init(&mut state);
        let Some(backend) = state.backend.as_ref() else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = backend.embedder.embed(query)?;
        let fetch = match scan_id {
            Some(_) => k.saturating_mul(SCOPED_FETCH_FACTOR).max(k),
            None => k,
        };
        let hits = backend
            .index
            .query(&embedding, fetch)?
            .into_iter()
            .filter(|hit| match scan_id {
                Some(scan) => {
                    matches!(hit.metadata.get("scan_id"), Some(ScalarValue::Str(s)) if s == scan)
                }
                None => true,
            })
            .take(k)
            .map(|hit| SearchHit {
                score: distance_to_score(hit.distance),
                text: hit.document,
                metadata: from_scalar_map(hit.metadata),
            })
            .collect();
        Ok(hits)
    }

    /// Drop every record and start again from `obs_0`.
    ///
    /// On a degraded store this retries construction first; if that still
    /// fails the store stays degraded and nothing is reported.  A failure
    /// while wiping a live index is returned.
    #[instrument(level = "debug", skip(self))]
    pub fn reset_database(&self) -> Result<(), MemoryError> {
        let mut guard = self.lock();
        if guard.status == StoreStatus::Degraded {
            guard.status = StoreStatus::Uninitialized;
        }
        self.ensure_init(&mut guard);
        let state = &mut *guard;
        let Some(backend) = state.backend.as_mut() else {
            warn!("memory reset skipped: store not ready");
            return Ok(());
        };
        backend.index.reset()?;
        state.mirror.clear();
        state.next_id = 0;
        self.warned_not_ready.store(false, Ordering::Relaxed);
        info!(collection = %self.config.collection, "memory database reset");
        Ok(())
    }

    /// Flush pending writes.  Safe at any time; failures are only logged.
    pub fn save(&self) {
        let mut state = self.lock();
        self.ensure_init(&mut state);
        if let Some(backend) = state.backend.as_mut()
            && let Err(e) = backend.index.flush()
        {
            warn!(error = %e, "memory flush failed");
        }
    }

    /// Copy of the in-memory mirror, oldest first.
    pub fn records(&self) -> Vec<MemoryRecord> {
        let mut state = self.lock();
        self.ensure_init(&mut state);
        state.mirror.clone()
    }

    /// Number of records in the mirror.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        self.ensure_init(&mut state);
        state.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
