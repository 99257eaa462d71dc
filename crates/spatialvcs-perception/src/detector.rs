//! Frame Detector/Tracker.
//!
//! Wraps a single [`DetectionModel`] instance behind a mutex so inference is
//! serialised, and keeps one [`IouTracker`] per scan so track ids stay stable
//! across the frames of that scan.
//!
//! The model is constructed lazily on the first call through a
//! [`ModelLoader`].  If construction fails the detector is permanently
//! *unavailable* for its lifetime and every call reports
//! [`DetectOutcome::ModelUnavailable`]; callers turn that into a placeholder
//! detection rather than an error.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use image::RgbImage;
use spatialvcs_types::BoundingBox;
use tracing::{debug, info, instrument, warn};

use crate::config::DetectorConfig;
use crate::error::PerceptionError;
use crate::tracker::IouTracker;

// ─────────────────────────────────────────────────────────────────────────────
// Model seam
// ─────────────────────────────────────────────────────────────────────────────

/// One box as reported by the model, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub xyxy: [f32; 4],
}

/// Inference settings handed to the model on every call.
#[derive(Debug, Clone, Copy)]
pub struct InferenceParams<'a> {
    pub classes: &'a [usize],
    pub confidence: f32,
    pub max_detections: usize,
    pub image_size: u32,
}

/// An object-detection backend.
///
/// Implementations are not required to be re-entrant; the [`Detector`]
/// never calls `infer` concurrently on the same instance.
pub trait DetectionModel: Send {
    /// Short identifier for logs, e.g. `"yolov8m"`.
    fn name(&self) -> &str;

    /// Class name for `class_id` in the model's vocabulary.
    fn class_name(&self, class_id: usize) -> Option<&str>;

    /// Run inference on one RGB frame.
    fn infer(
        &mut self,
        frame: &RgbImage,
        params: &InferenceParams<'_>,
    ) -> Result<Vec<RawDetection>, PerceptionError>;
}

/// What a [`ModelLoader`] produces.
pub type LoadResult = Result<Box<dyn DetectionModel>, PerceptionError>;

/// Factory that builds the model on first use.
pub type ModelLoader = Box<dyn Fn(&DetectorConfig) -> LoadResult + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// A detection in image space, before world projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetection {
    pub label: String,
    pub confidence: f32,
    pub track_id: Option<u32>,
    pub bbox: BoundingBox,
}

/// How identities were assigned for one detect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Boxes carry per-scan track ids.
    Tracked,
    /// Tracking is switched off in configuration.
    Disabled,
    /// The tracker could not be built; boxes are untracked for this call.
    Fallback,
}

/// Result of one detect call.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectOutcome {
    Detected {
        detections: Vec<ImageDetection>,
        tracking: TrackingMode,
    },
    /// The model failed to initialise; nothing was run.
    ModelUnavailable,
}

// ─────────────────────────────────────────────────────────────────────────────
// Detector
// ─────────────────────────────────────────────────────────────────────────────

type SharedModel = Mutex<Box<dyn DetectionModel>>;

/// Shared detector: one lazily built model plus per-scan trackers.
pub struct Detector {
    config: DetectorConfig,
    loader: ModelLoader,
    /// `Some` once loaded, `None` once loading failed.
    model: OnceLock<Option<SharedModel>>,
    trackers: Mutex<HashMap<String, IouTracker>>,
}

impl Detector {
    /// Create a detector that builds its model with `loader` on first use.
    pub fn new(config: DetectorConfig, loader: ModelLoader) -> Self {
        Self {
            config,
            loader,
            model: OnceLock::new(),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Create a detector with no inference backend.
    ///
    /// Every call reports [`DetectOutcome::ModelUnavailable`]; frames are
    /// still persisted and projected by the caller.
    pub fn without_model(config: DetectorConfig) -> Self {
        Self::new(
            config,
            Box::new(|cfg: &DetectorConfig| -> LoadResult {
                Err(PerceptionError::ModelUnavailable(match &cfg.weights_path {
                    Some(p) => format!("no inference backend available for {}", p.display()),
                    None => "no model weights configured".to_string(),
                }))
            }),
        )
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Whether the model loaded.  Triggers loading on first call.
    pub fn is_available(&self) -> bool {
        self.model().is_some()
    }

    fn model(&self) -> Option<&SharedModel> {
        self.model
            .get_or_init(|| match (self.loader)(&self.config) {
                Ok(model) => {
                    info!(model = model.name(), "detection model loaded");
                    Some(Mutex::new(model))
                }
                Err(e) => {
                    warn!(error = %e, "detection model unavailable; frames will be returned unprocessed");
                    None
                }
            })
            .as_ref()
    }

    /// Detect objects in `frame` for `scan_id`.
    ///
    /// Inference failures are propagated; a missing model and a broken
    /// tracker are not.
    #[instrument(skip(self, frame), fields(width = frame.width(), height = frame.height()))]
    pub fn detect(&self, frame: &RgbImage, scan_id: &str) -> Result<DetectOutcome, PerceptionError> {
        let Some(shared) = self.model() else {
            return Ok(DetectOutcome::ModelUnavailable);
        };

        let params = InferenceParams {
            classes: &self.config.target_classes,
            confidence: self.config.confidence,
            max_detections: self.config.max_detections,
            image_size: self.config.image_size,
        };

        // Held through tracking so per-scan frame order matches inference order.
        let mut model = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = model.infer(frame, &params)?;
        let kept = self.filter(raw);

        let (track_ids, tracking) = if self.config.tracking {
            self.assign_tracks(scan_id, &kept)
        } else {
            (vec![None; kept.len()], TrackingMode::Disabled)
        };

        let detections = kept
            .into_iter()
            .zip(track_ids)
            .map(|((raw, bbox), track_id)| ImageDetection {
                label: model
                    .class_name(raw.class_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{}", raw.class_id)),
                confidence: raw.confidence,
                track_id,
                bbox,
            })
            .collect::<Vec<_>>();

        debug!(count = detections.len(), ?tracking, "frame detected");
        Ok(DetectOutcome::Detected {
            detections,
            tracking,
        })
    }

    /// Forget the tracker state of a finished scan.
    pub fn end_scan(&self, scan_id: &str) {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scan_id);
    }

    /// Apply the allow-list, threshold and cap, dropping boxes that collapse
    /// to zero area once truncated to whole pixels.
    fn filter(&self, raw: Vec<RawDetection>) -> Vec<(RawDetection, BoundingBox)> {
        let mut kept: Vec<(RawDetection, BoundingBox)> = raw
            .into_iter()
            .filter(|d| self.config.target_classes.contains(&d.class_id))
            .filter(|d| d.confidence >= self.config.confidence)
            .filter_map(|d| {
                let [x1, y1, x2, y2] = d.xyxy;
                let bbox = BoundingBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32);
                (bbox.width() > 0 && bbox.height() > 0).then_some((d, bbox))
            })
            .collect();
        kept.sort_by(|a, b| b.0.confidence.total_cmp(&a.0.confidence));
        kept.truncate(self.config.max_detections);
        kept
    }

    fn assign_tracks(
        &self,
        scan_id: &str,
        kept: &[(RawDetection, BoundingBox)],
    ) -> (Vec<Option<u32>>, TrackingMode) {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        if !trackers.contains_key(scan_id) {
            match IouTracker::new(&self.config.tracker) {
                Ok(t) => {
                    trackers.insert(scan_id.to_string(), t);
                }
                Err(e) => {
                    warn!(scan_id, error = %e, "tracker init failed; detecting untracked");
                    return (vec![None; kept.len()], TrackingMode::Fallback);
                }
            }
        }
        let Some(tracker) = trackers.get_mut(scan_id) else {
            return (vec![None; kept.len()], TrackingMode::Fallback);
        };
        let boxes: Vec<(usize, [f32; 4])> = kept.iter().map(|(d, _)| (d.class_id, d.xyxy)).collect();
        let ids = tracker.update(&boxes).into_iter().map(Some).collect();
        (ids, TrackingMode::Tracked)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::TrackerConfig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame() -> RgbImage {
        RgbImage::new(64, 48)
    }

    fn detected(outcome: DetectOutcome) -> (Vec<ImageDetection>, TrackingMode) {
        match outcome {
            DetectOutcome::Detected {
                detections,
                tracking,
            } => (detections, tracking),
            DetectOutcome::ModelUnavailable => panic!("model should be available"),
        }
    }

    // ── availability ─────────────────────────────────────────────────────────

    #[test]
    fn without_model_reports_unavailable() {
        let det = Detector::without_model(DetectorConfig::default());
        assert!(!det.is_available());
        let out = det.detect(&frame(), "s1").unwrap();
        assert_eq!(out, DetectOutcome::ModelUnavailable);
    }

    #[test]
    fn loader_runs_once_even_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let det = Detector::new(
            DetectorConfig::default(),
            Box::new(move |_: &DetectorConfig| -> LoadResult {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PerceptionError::ModelUnavailable("missing weights".into()))
            }),
        );
        det.detect(&frame(), "s1").unwrap();
        det.detect(&frame(), "s1").unwrap();
        assert!(!det.is_available());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    // ── filtering ────────────────────────────────────────────────────────────

    #[test]
    fn filters_by_class_confidence_and_cap() {
        let cfg = DetectorConfig {
            max_detections: 2,
            ..DetectorConfig::default()
        };
        let det = scripted_detector(
            cfg,
            vec![
                raw(41, 0.50, [0.0, 0.0, 10.0, 10.0]),
                raw(2, 0.99, [0.0, 0.0, 10.0, 10.0]), // car: not allow-listed
                raw(56, 0.10, [0.0, 0.0, 10.0, 10.0]), // below threshold
                raw(0, 0.90, [20.0, 20.0, 30.0, 30.0]),
                raw(56, 0.40, [40.0, 0.0, 50.0, 10.0]),
            ],
        );
        let (dets, _) = detected(det.detect(&frame(), "s1").unwrap());
        let labels: Vec<&str> = dets.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "cup"]);
    }

    #[test]
    fn sub_pixel_boxes_are_dropped() {
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [5.2, 5.0, 5.9, 9.0])],
        );
        let (dets, _) = detected(det.detect(&frame(), "s1").unwrap());
        assert!(dets.is_empty());
    }

    #[test]
    fn bbox_is_truncated_to_pixels() {
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [1.7, 2.2, 30.9, 40.5])],
        );
        let (dets, _) = detected(det.detect(&frame(), "s1").unwrap());
        assert_eq!(dets[0].bbox, BoundingBox::new(1, 2, 30, 40));
    }

    // ── tracking ─────────────────────────────────────────────────────────────

    #[test]
    fn track_ids_persist_within_a_scan() {
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [0.0, 0.0, 10.0, 10.0])],
        );
        let (a, mode) = detected(det.detect(&frame(), "s1").unwrap());
        let (b, _) = detected(det.detect(&frame(), "s1").unwrap());
        assert_eq!(mode, TrackingMode::Tracked);
        assert_eq!(a[0].track_id, Some(1));
        assert_eq!(b[0].track_id, Some(1));
    }

    #[test]
    fn scans_track_independently() {
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![
                raw(41, 0.9, [0.0, 0.0, 10.0, 10.0]),
                raw(0, 0.8, [30.0, 30.0, 40.0, 40.0]),
            ],
        );
        detected(det.detect(&frame(), "s1").unwrap());
        let (other, _) = detected(det.detect(&frame(), "s2").unwrap());
        let ids: Vec<Option<u32>> = other.iter().map(|d| d.track_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn end_scan_resets_identities() {
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [0.0, 0.0, 10.0, 10.0])],
        );
        detected(det.detect(&frame(), "s1").unwrap());
        det.end_scan("s1");
        let (dets, _) = detected(det.detect(&frame(), "s1").unwrap());
        assert_eq!(dets[0].track_id, Some(1));
    }

    #[test]
    fn tracking_disabled_leaves_ids_empty() {
        let cfg = DetectorConfig {
            tracking: false,
            ..DetectorConfig::default()
        };
        let det = scripted_detector(cfg, vec![raw(41, 0.9, [0.0, 0.0, 10.0, 10.0])]);
        let (dets, mode) = detected(det.detect(&frame(), "s1").unwrap());
        assert_eq!(mode, TrackingMode::Disabled);
        assert_eq!(dets[0].track_id, None);
    }

    #[test]
    fn broken_tracker_falls_back_to_untracked() {
        let cfg = DetectorConfig {
            tracker: TrackerConfig {
                iou_threshold: 2.0,
                max_age: 30,
            },
            ..DetectorConfig::default()
        };
        let det = scripted_detector(cfg, vec![raw(41, 0.9, [0.0, 0.0, 10.0, 10.0])]);
        let (dets, mode) = detected(det.detect(&frame(), "s1").unwrap());
        assert_eq!(mode, TrackingMode::Fallback);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].track_id, None);
    }

    #[test]
    fn concurrent_callers_share_one_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (l, c) = (Arc::clone(&loads), Arc::clone(&calls));
        let det = Arc::new(Detector::new(
            DetectorConfig::default(),
            Box::new(move |_: &DetectorConfig| -> LoadResult {
                l.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedModel {
                    names: coco_names(),
                    boxes: vec![raw(41, 0.9, [0.0, 0.0, 10.0, 10.0])],
                    calls: Arc::clone(&c),
                }) as Box<dyn DetectionModel>)
            }),
        ));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let det = Arc::clone(&det);
                std::thread::spawn(move || {
                    det.detect(&RgbImage::new(8, 8), &format!("scan-{i}")).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
