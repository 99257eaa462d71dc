//! Memory store settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::embedding::EMBEDDING_DIM;

/// Where the vector index lives and what shape its vectors have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the index database file.
    #[serde(default = "default_persist_dir")]
    pub persist_dir: PathBuf,
    /// Logical collection; doubles as the SQLite table and file name.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Embedding dimension every stored vector must have.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

fn default_persist_dir() -> PathBuf {
    PathBuf::from("data/memory")
}
fn default_collection() -> String {
    "spatial_memory".to_string()
}
fn default_dimensions() -> usize {
    EMBEDDING_DIM
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            persist_dir: default_persist_dir(),
            collection: default_collection(),
            dimensions: default_dimensions(),
        }
    }
}

impl MemoryConfig {
    /// Full path of the database file for this collection.
    pub fn database_path(&self) -> PathBuf {
        self.persist_dir.join(format!("{}.sqlite3", self.collection))
    }
}
