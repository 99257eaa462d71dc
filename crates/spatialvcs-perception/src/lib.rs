//! `spatialvcs-perception` – from camera frames to world-space detections.
//!
//! # Modules
//!
//! - [`transform`] – [`Pose`][transform::Pose] parsing (reshape-then-transpose
//!   wire convention) and the pinhole [`project`][transform::project]ion of a
//!   pixel plus depth into world space.
//! - [`detector`] – [`Detector`][detector::Detector]: a lazily loaded,
//!   mutex-serialised [`DetectionModel`][detector::DetectionModel] with
//!   per-scan identity tracking and a degraded mode when no model loads.
//! - [`tracker`] – [`IouTracker`][tracker::IouTracker]: greedy IoU
//!   association that keeps track ids stable across a scan's frames.
//! - [`frame`] – [`FrameProcessor`][frame::FrameProcessor]: decode → persist
//!   → detect → project for one frame, plus padded object crops.
//! - [`config`] – detector and frame-processor settings with `SPATIAL_*`
//!   environment overrides.

pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod tracker;
pub mod transform;

pub use config::{DetectorConfig, FrameProcessorConfig, TrackerConfig};
pub use detector::{DetectOutcome, DetectionModel, Detector, ModelLoader, TrackingMode};
pub use error::PerceptionError;
pub use frame::{FrameOutcome, FrameProcessor, crop_detections};
pub use transform::{Pose, project};
