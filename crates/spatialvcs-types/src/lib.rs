//! `spatialvcs-types` – records shared by the perception and memory layers.
//!
//! A [`Detection`] is produced once per recognised object per frame and is
//! never mutated afterwards; tracking continuity is expressed only by the same
//! `track_id` appearing on later detections of the same scan.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Open-ended per-record metadata bag.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Label carried by the single placeholder detection emitted when no
/// detection model is available.
pub const UNPROCESSED_FRAME_LABEL: &str = "unprocessed_frame";

/// Integer pixel rectangle, serialised as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self::new(x1, y1, x2, y2)
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// A point in world space (metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Serde adapter that writes an untracked `track_id` as `-1`.
///
/// Dashboards consume the integer form, so `None` must round-trip through
/// the sentinel rather than `null`.
pub mod track_id {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Wire value for "no stable identity".
    pub const UNTRACKED: i64 = -1;

    pub fn serialize<S: Serializer>(id: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(id.map_or(UNTRACKED, i64::from))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(d)?;
        Ok(u32::try_from(raw).ok())
    }
}

/// One recognised object in one frame, projected into world space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class name from the detector vocabulary (e.g. `"cup"`).
    pub label: String,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Tracker identity, stable across frames of the same scan.
    #[serde(with = "track_id")]
    pub track_id: Option<u32>,
    pub bbox: BoundingBox,
    pub position_3d: Position3,
    /// Persisted source image this detection was produced from.
    pub frame_path: PathBuf,
    pub scan_id: String,
}

impl Detection {
    /// Pixel centre `(u, v)` of the bounding box.
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.bbox.x1 + self.bbox.x2) / 2.0,
            f64::from(self.bbox.y1 + self.bbox.y2) / 2.0,
        )
    }

    /// True for the placeholder emitted in degraded mode.
    pub fn is_unprocessed(&self) -> bool {
        self.label == UNPROCESSED_FRAME_LABEL
    }
}

/// Global error type spanning perception, memory and collaborator failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpatialError {
    #[error("Perception Error: {0}")]
    Perception(String),

    #[error("Memory Store Error: {0}")]
    Memory(String),

    #[error("Collaborator Error: {0}")]
    Collaborator(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
