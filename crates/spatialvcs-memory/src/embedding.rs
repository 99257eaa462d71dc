//! Text embedders.
//!
//! [`HashEmbedder`] is always available: it hashes word tokens into a fixed
//! number of signed buckets and L2-normalises the result, so texts sharing
//! words land close together.  It captures no synonymy.  With the
//! `fastembed-embeddings` feature, [`FastEmbedEmbedder`] runs
//! all-MiniLM-L6-v2 locally for real semantic vectors of the same width.

use crate::error::MemoryError;

/// Output width of all-MiniLM-L6-v2, and of [`HashEmbedder`] by default.
pub const EMBEDDING_DIM: usize = 384;

/// Turns text into a fixed-width vector.
pub trait Embedder: Send + Sync {
    /// Length of every vector [`embed`][Embedder::embed] returns.
    fn dimensions(&self) -> usize;

    /// Embed one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HashEmbedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Words beyond this many are ignored.
    const MAX_TOKENS: usize = 1000;

    pub fn new() -> Self {
        Self::with_dimensions(EMBEDDING_DIM)
    }

    /// A zero width is bumped to one.
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    // FNV-1a keeps bucket assignment stable across toolchains, which matters
    // because vectors outlive the process in the index.
    fn fnv1a(token: &str) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        h
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut v = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .take(Self::MAX_TOKENS);
        for token in tokens {
            let h = Self::fnv1a(token);
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FastEmbedEmbedder
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "fastembed-embeddings")]
mod native {
    use std::sync::{Mutex, PoisonError};
    use std::time::Instant;

    use super::{EMBEDDING_DIM, Embedder};
    use crate::error::MemoryError;

    /// all-MiniLM-L6-v2 through `fastembed`.
    ///
    /// The ONNX session is loaded by [`try_new`][FastEmbedEmbedder::try_new];
    /// a load failure is what sends a store into degraded mode.
    pub struct FastEmbedEmbedder {
        model: Mutex<fastembed::TextEmbedding>,
    }

    impl FastEmbedEmbedder {
        pub fn try_new() -> Result<Self, MemoryError> {
            let start = Instant::now();
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(false);
            let model = fastembed::TextEmbedding::try_new(options)
                .map_err(|e| MemoryError::Embedding(e.to_string()))?;
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                model = "all-MiniLM-L6-v2",
                "embedding model loaded"
            );
            Ok(Self {
                model: Mutex::new(model),
            })
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn dimensions(&self) -> usize {
            EMBEDDING_DIM
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            model
                .embed(vec![text.to_string()], None)
                .map_err(|e| MemoryError::Embedding(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| MemoryError::Embedding("model returned no vector".to_string()))
        }
    }
}

#[cfg(feature = "fastembed-embeddings")]
pub use native::FastEmbedEmbedder;

/// The best embedder this build offers.
pub fn default_embedder() -> Result<Box<dyn Embedder>, MemoryError> {
    #[cfg(feature = "fastembed-embeddings")]
    {
        Ok(Box::new(FastEmbedEmbedder::try_new()?))
    }
    #[cfg(not(feature = "fastembed-embeddings"))]
    {
        Ok(Box::new(HashEmbedder::new()))
    }
}
