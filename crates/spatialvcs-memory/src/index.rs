//! Persistent vector index.
//!
//! [`SqliteIndex`] keeps every record of one collection in a single SQLite
//! table and answers nearest-neighbour queries by exact scan, ranked by
//! squared Euclidean distance (nearest first).  Writes commit before the call
//! returns.
//!
//! # Storage layout
//!
//! | column    | type    | description                                  |
//! |-----------|---------|----------------------------------------------|
//! | seq       | INTEGER | insertion order (rowid)                      |
//! | id        | TEXT    | record identifier, unique                    |
//! | document  | TEXT    | observation text                             |
//! | embedding | BLOB    | little-endian f32 vector (4 × N bytes)       |
//! | metadata  | TEXT    | JSON object of scalar values                 |
//!
//! # Example
//!
//! ```rust
//! use spatialvcs_memory::index::{SqliteIndex, VectorIndex};
//! use spatialvcs_memory::metadata::ScalarMap;
//!
//! let mut index = SqliteIndex::open_in_memory("demo", 3).unwrap();
//! index.add("obs_0", "red mug", &[1.0, 0.0, 0.0], &ScalarMap::new()).unwrap();
//! index.add("obs_1", "green plant", &[0.0, 0.0, 1.0], &ScalarMap::new()).unwrap();
//!
//! let hits = index.query(&[0.9, 0.1, 0.0], 1).unwrap();
//! assert_eq!(hits[0].document, "red mug");
//! ```

use std::path::Path;

use rusqlite::{Connection, params};

use crate::error::MemoryError;
use crate::metadata::ScalarMap;

/// One stored record as read back from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub document: String,
    pub metadata: ScalarMap,
}

/// A query result with its raw distance to the query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub document: String,
    pub metadata: ScalarMap,
    /// Squared L2 distance; `0.0` for an identical vector.
    pub distance: f32,
}

/// Storage seam behind the memory store.
pub trait VectorIndex: Send {
    /// Append one record.
    fn add(
        &mut self,
        id: &str,
        document: &str,
        embedding: &[f32],
        metadata: &ScalarMap,
    ) -> Result<(), MemoryError>;

    /// Up to `n` records, nearest first.
    fn query(&self, embedding: &[f32], n: usize) -> Result<Vec<IndexHit>, MemoryError>;

    /// Every record in insertion order.
    fn snapshot(&self) -> Result<Vec<IndexRecord>, MemoryError>;

    fn count(&self) -> Result<usize, MemoryError>;

    /// Drop the collection and recreate it empty.
    fn reset(&mut self) -> Result<(), MemoryError>;

    /// Make prior writes durable.
    fn flush(&mut self) -> Result<(), MemoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Squared Euclidean distance between equal-length vectors.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteIndex
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`VectorIndex`] for one collection.
pub struct SqliteIndex {
    conn: Connection,
    table: String,
    dimensions: usize,
}

impl SqliteIndex {
    /// Open (or create) `collection` inside the database file at `path`.
    pub fn open(path: &Path, collection: &str, dimensions: usize) -> Result<Self, MemoryError> {
        validate_collection(collection)?;
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, collection, dimensions)
    }

    /// A throwaway in-memory index.
    pub fn open_in_memory(collection: &str, dimensions: usize) -> Result<Self, MemoryError> {
        validate_collection(collection)?;
        Self::with_connection(Connection::open_in_memory()?, collection, dimensions)
    }

    fn with_connection(
        conn: Connection,
        collection: &str,
        dimensions: usize,
    ) -> Result<Self, MemoryError> {
        let index = Self {
            conn,
            table: collection.to_string(),
            dimensions,
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), MemoryError> {
        self.conn.execute_batch(&schema_sql(&self.table))?;
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.len() != self.dimensions {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        Ok(())
    }

    fn all_rows(&self) -> Result<Vec<(IndexRecord, Vec<f32>)>, MemoryError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, document, embedding, metadata FROM \"{}\" ORDER BY seq ASC",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let document: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let metadata: String = row.get(3)?;
            Ok((id, document, blob, metadata))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, document, blob, metadata) = row?;
            let metadata: ScalarMap = serde_json::from_str(&metadata)?;
            out.push((
                IndexRecord {
                    id,
                    document,
                    metadata,
                },
                bytes_to_embedding(&blob),
            ));
        }
        Ok(out)
    }
}

fn schema_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            seq       INTEGER PRIMARY KEY AUTOINCREMENT,
            id        TEXT NOT NULL UNIQUE,
            document  TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata  TEXT NOT NULL
        );"
    )
}

fn validate_collection(name: &str) -> Result<(), MemoryError> {
    let ok = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MemoryError::InvalidCollection(name.to_string()))
    }
}

impl VectorIndex for SqliteIndex {
    fn add(
        &mut self,
        id: &str,
        document: &str,
        embedding: &[f32],
        metadata: &ScalarMap,
    ) -> Result<(), MemoryError> {
        self.check_dimensions(embedding)?;
        let meta = serde_json::to_string(metadata)?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, document, embedding, metadata) VALUES (?1, ?2, ?3, ?4)",
                self.table
            ),
            params![id, document, embedding_to_bytes(embedding), meta],
        )?;
        Ok(())
    }

    fn query(&self, embedding: &[f32], n: usize) -> Result<Vec<IndexHit>, MemoryError> {
        self.check_dimensions(embedding)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut scored: Vec<IndexHit> = self
            .all_rows()?
            .into_iter()
            .filter(|(_, v)| v.len() == embedding.len())
            .map(|(rec, v)| IndexHit {
                distance: squared_l2(&v, embedding),
                id: rec.id,
                document: rec.document,
                metadata: rec.metadata,
            })
            .collect();
        // Stable: ties keep insertion order.
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(n);
        Ok(scored)
    }

    fn snapshot(&self) -> Result<Vec<IndexRecord>, MemoryError> {
        Ok(self.all_rows()?.into_iter().map(|(rec, _)| rec).collect())
    }

    fn count(&self) -> Result<usize, MemoryError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Drop and recreate the table in one transaction; on failure the old
    /// rows are still there.
    fn reset(&mut self) -> Result<(), MemoryError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", self.table))?;
        tx.execute_batch(&schema_sql(&self.table))?;
        tx.commit()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MemoryError> {
        // Every statement above runs in autocommit mode.
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ScalarValue;

    fn meta(scan: &str) -> ScalarMap {
        let mut m = ScalarMap::new();
        m.insert("scan_id".to_string(), ScalarValue::Str(scan.to_string()));
        m
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn embedding_bytes_roundtrip() {
        let original = vec![1.5f32, -0.25, 0.0, 42.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&original)), original);
    }

    #[test]
    fn squared_l2_of_identical_vectors_is_zero() {
        assert_eq!(squared_l2(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert_eq!(squared_l2(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }

    #[test]
    fn collection_names_are_validated() {
        assert!(SqliteIndex::open_in_memory("spatial_memory", 2).is_ok());
        let err = SqliteIndex::open_in_memory("bad\"name", 2).err().unwrap();
        assert!(matches!(err, MemoryError::InvalidCollection(_)));
    }

    // ── SqliteIndex ──────────────────────────────────────────────────────────

    #[test]
    fn query_ranks_nearest_first() {
        let mut idx = SqliteIndex::open_in_memory("t", 3).unwrap();
        idx.add("a", "far", &[0.0, 0.0, 1.0], &meta("s1")).unwrap();
        idx.add("b", "near", &[1.0, 0.0, 0.0], &meta("s1")).unwrap();
        let hits = idx.query(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].document, "near");
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[1].document, "far");
        assert!((hits[1].distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn query_limits_results() {
        let mut idx = SqliteIndex::open_in_memory("t", 2).unwrap();
        for i in 0..5 {
            idx.add(&format!("obs_{i}"), "x", &[i as f32, 1.0], &meta("s1")).unwrap();
        }
        assert_eq!(idx.query(&[2.0, 1.0], 3).unwrap().len(), 3);
        assert!(idx.query(&[2.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut idx = SqliteIndex::open_in_memory("t", 3).unwrap();
        let err = idx.add("a", "x", &[1.0], &meta("s1")).unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { expected: 3, got: 1 }));
        assert!(idx.query(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn duplicate_id_is_an_error() {
        let mut idx = SqliteIndex::open_in_memory("t", 1).unwrap();
        idx.add("obs_0", "x", &[1.0], &meta("s1")).unwrap();
        assert!(idx.add("obs_0", "y", &[1.0], &meta("s1")).is_err());
    }

    #[test]
    fn snapshot_preserves_insertion_order_and_metadata() {
        let mut idx = SqliteIndex::open_in_memory("t", 1).unwrap();
        idx.add("obs_0", "first", &[1.0], &meta("s1")).unwrap();
        idx.add("obs_1", "second", &[0.0], &meta("s2")).unwrap();
        let all = idx.snapshot().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].document, "first");
        assert_eq!(all[1].metadata, meta("s2"));
        assert_eq!(idx.count().unwrap(), 2);
    }

    #[test]
    fn reset_empties_and_is_idempotent() {
        let mut idx = SqliteIndex::open_in_memory("t", 1).unwrap();
        idx.add("obs_0", "x", &[1.0], &meta("s1")).unwrap();
        idx.reset().unwrap();
        assert_eq!(idx.count().unwrap(), 0);
        idx.reset().unwrap();
        assert!(idx.query(&[1.0], 5).unwrap().is_empty());
        idx.add("obs_0", "again", &[1.0], &meta("s1")).unwrap();
        assert_eq!(idx.count().unwrap(), 1);
    }

    #[test]
    fn failed_reset_keeps_records() {
        let mut idx = SqliteIndex::open_in_memory("t", 1).unwrap();
        idx.add("obs_0", "x", &[1.0], &meta("s1")).unwrap();
        idx.conn.execute_batch("PRAGMA query_only = ON;").unwrap();

        assert!(idx.reset().is_err());
        assert_eq!(idx.count().unwrap(), 1);
        assert_eq!(idx.snapshot().unwrap()[0].document, "x");
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mem.sqlite3");
        {
            let mut idx = SqliteIndex::open(&path, "spatial_memory", 2).unwrap();
            idx.add("obs_0", "chair", &[0.0, 1.0], &meta("s1")).unwrap();
            idx.flush().unwrap();
        }
        let idx = SqliteIndex::open(&path, "spatial_memory", 2).unwrap();
        assert_eq!(idx.count().unwrap(), 1);
        assert_eq!(idx.snapshot().unwrap()[0].id, "obs_0");
    }
}
