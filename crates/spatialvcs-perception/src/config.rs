//! Detector and frame-processor settings.
//!
//! Values are read once when a [`Detector`][crate::detector::Detector] or
//! [`FrameProcessor`][crate::frame::FrameProcessor] is built; they cannot be
//! overridden per call.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// COCO class ids kept by default: person plus common indoor furniture and
/// desktop / handheld items.
pub const DEFAULT_TARGET_CLASSES: [usize; 19] = [
    0, 24, 26, 28, 39, 41, 56, 57, 58, 59, 60, 62, 63, 64, 65, 66, 67, 73, 74,
];

/// Identity-association settings for the per-scan tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Frames a track may go unmatched before it is retired.
    #[serde(default = "default_max_age")]
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: default_iou_threshold(),
            max_age: default_max_age(),
        }
    }
}

/// Inference settings shared by every detect call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Allow-list of model class ids.
    #[serde(default = "default_target_classes")]
    pub target_classes: Vec<usize>,
    /// Minimum confidence for a box to be reported.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Upper bound on boxes reported per frame.
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Square inference resolution handed to the model.
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Assign stable track ids across frames of a scan.
    #[serde(default = "default_tracking")]
    pub tracking: bool,
    /// Model weights; absent or missing file means the detector runs degraded.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_target_classes() -> Vec<usize> {
    DEFAULT_TARGET_CLASSES.to_vec()
}
fn default_confidence() -> f32 {
    0.35
}
fn default_max_detections() -> usize {
    30
}
fn default_image_size() -> u32 {
    640
}
fn default_tracking() -> bool {
    true
}
fn default_iou_threshold() -> f32 {
    0.3
}
fn default_max_age() -> u32 {
    30
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            target_classes: default_target_classes(),
            confidence: default_confidence(),
            max_detections: default_max_detections(),
            image_size: default_image_size(),
            tracking: default_tracking(),
            weights_path: None,
            tracker: TrackerConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Defaults with `SPATIAL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    /// Apply `SPATIAL_*` environment variable overrides.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `SPATIAL_TARGET_CLASSES` | `target_classes` (comma list) |
    /// | `SPATIAL_DETECT_CONF` | `confidence` |
    /// | `SPATIAL_MAX_DETECTIONS` | `max_detections` |
    /// | `SPATIAL_MODEL_IMGSZ` | `image_size` |
    /// | `SPATIAL_USE_TRACKING` | `tracking` (`0`, `false`, `no` disable) |
    /// | `SPATIAL_MODEL_WEIGHTS` | `weights_path` |
    ///
    /// Unparsable values leave the field untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPATIAL_TARGET_CLASSES") {
            self.target_classes = parse_class_list(&v);
        }
        if let Ok(v) = std::env::var("SPATIAL_DETECT_CONF")
            && let Ok(conf) = v.trim().parse::<f32>()
        {
            self.confidence = conf;
        }
        if let Ok(v) = std::env::var("SPATIAL_MAX_DETECTIONS")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            self.max_detections = n;
        }
        if let Ok(v) = std::env::var("SPATIAL_MODEL_IMGSZ")
            && let Ok(n) = v.trim().parse::<u32>()
        {
            self.image_size = n;
        }
        if let Ok(v) = std::env::var("SPATIAL_USE_TRACKING") {
            self.tracking = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("SPATIAL_MODEL_WEIGHTS") {
            self.weights_path = Some(PathBuf::from(v));
        }
    }
}

/// Parse a comma-separated class-id list, skipping blanks and junk.
///
/// An empty result falls back to [`DEFAULT_TARGET_CLASSES`].
pub fn parse_class_list(raw: &str) -> Vec<usize> {
    let ids: Vec<usize> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    if ids.is_empty() {
        default_target_classes()
    } else {
        ids
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim().to_lowercase().as_str(), "0" | "false" | "no")
}

/// Where and how frames are written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameProcessorConfig {
    /// Root under which `<scan_id>/frame_<hex>.jpg` files are written.
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Smallest padded crop side that is still worth describing.
    #[serde(default = "default_min_crop_size")]
    pub min_crop_size: u32,
}

fn default_frames_dir() -> PathBuf {
    PathBuf::from("data/frames")
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_min_crop_size() -> u32 {
    32
}

impl Default for FrameProcessorConfig {
    fn default() -> Self {
        Self {
            frames_dir: default_frames_dir(),
            jpeg_quality: default_jpeg_quality(),
            min_crop_size: default_min_crop_size(),
        }
    }
}
