//! Frame Processor.
//!
//! Runs one probe frame end to end:
//!
//! 1. decode the encoded image (undecodable → [`FrameOutcome::Undecodable`]),
//! 2. persist it as `<frames_dir>/<scan_id>/frame_<uuid hex>.jpg`,
//! 3. parse the pose (malformed → identity),
//! 4. optionally stop there ([`FrameOutcome::Persisted`]),
//! 5. detect/track and project each detection into world space.  A failed
//!    inference call degrades to the whole-frame placeholder.
//!
//! It also cuts padded per-object crops for the description collaborator via
//! [`crop_detections`].

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use image::codecs::jpeg::JpegEncoder;
use image::{RgbImage, imageops};
use spatialvcs_types::{BoundingBox, Detection, Position3, UNPROCESSED_FRAME_LABEL};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::FrameProcessorConfig;
use crate::detector::{DetectOutcome, Detector, TrackingMode};
use crate::error::PerceptionError;
use crate::transform::{Pose, project};

/// Fraction of the box size added on each side of a crop.
pub const CROP_PADDING: f64 = 0.1;

// ─────────────────────────────────────────────────────────────────────────────
// FrameOutcome
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The payload could not be decoded; nothing was written.
    Undecodable,
    /// Detection was not requested; only the frame was stored.
    Persisted { frame_path: PathBuf },
    /// No model is available, or inference failed for this frame; a single
    /// whole-frame placeholder is returned.
    Degraded {
        detections: Vec<Detection>,
        frame_path: PathBuf,
    },
    Detected {
        detections: Vec<Detection>,
        frame_path: PathBuf,
        tracking: TrackingMode,
    },
}

impl FrameOutcome {
    /// Flatten into `(detections, frame_path)`.
    pub fn into_parts(self) -> (Vec<Detection>, Option<PathBuf>) {
        match self {
            Self::Undecodable => (Vec::new(), None),
            Self::Persisted { frame_path } => (Vec::new(), Some(frame_path)),
            Self::Degraded {
                detections,
                frame_path,
            }
            | Self::Detected {
                detections,
                frame_path,
                ..
            } => (detections, Some(frame_path)),
        }
    }

    pub fn detections(&self) -> &[Detection] {
        match self {
            Self::Degraded { detections, .. } | Self::Detected { detections, .. } => detections,
            _ => &[],
        }
    }

    pub fn frame_path(&self) -> Option<&Path> {
        match self {
            Self::Undecodable => None,
            Self::Persisted { frame_path }
            | Self::Degraded { frame_path, .. }
            | Self::Detected { frame_path, .. } => Some(frame_path),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameProcessor
// ─────────────────────────────────────────────────────────────────────────────

/// Decode → persist → detect → project, one frame at a time.
pub struct FrameProcessor {
    config: FrameProcessorConfig,
    detector: Detector,
    pose_warned: AtomicBool,
}

impl FrameProcessor {
    pub fn new(config: FrameProcessorConfig, detector: Detector) -> Self {
        Self {
            config,
            detector,
            pose_warned: AtomicBool::new(false),
        }
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn config(&self) -> &FrameProcessorConfig {
        &self.config
    }

    /// Process one frame.
    ///
    /// Only a failure to write the frame is an `Err`.  Bad image bytes, bad
    /// poses, a missing model and a failed inference call are all reported
    /// through [`FrameOutcome`], so a persisted frame is always returned.
    #[instrument(skip(self, image_bytes, pose_text), fields(bytes = image_bytes.len()))]
    pub fn process(
        &self,
        image_bytes: &[u8],
        center_depth: f64,
        pose_text: &str,
        scan_id: &str,
        run_detection: bool,
    ) -> Result<FrameOutcome, PerceptionError> {
        let frame = match image::load_from_memory(image_bytes) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                debug!(error = %e, "frame payload is not a decodable image");
                return Ok(FrameOutcome::Undecodable);
            }
        };

        let frame_path = self.persist(&frame, scan_id)?;

        let (pose, pose_err) = Pose::parse_or_identity(pose_text);
        if let Some(e) = pose_err {
            if self.pose_warned.swap(true, Ordering::Relaxed) {
                debug!(error = %e, "malformed pose, using identity");
            } else {
                warn!(error = %e, "malformed pose, using identity (further warnings suppressed)");
            }
        }

        if !run_detection {
            return Ok(FrameOutcome::Persisted { frame_path });
        }

        let (width, height) = frame.dimensions();
        let outcome = match self.detector.detect(&frame, scan_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(scan_id, error = %e, "inference failed; returning unprocessed frame");
                DetectOutcome::ModelUnavailable
            }
        };
        match outcome {
            DetectOutcome::ModelUnavailable => {
                let placeholder = Detection {
                    label: UNPROCESSED_FRAME_LABEL.to_string(),
                    confidence: 0.0,
                    track_id: None,
                    bbox: BoundingBox::new(0, 0, width as i32, height as i32),
                    position_3d: Position3::new(0.0, 0.0, center_depth),
                    frame_path: frame_path.clone(),
                    scan_id: scan_id.to_string(),
                };
                Ok(FrameOutcome::Degraded {
                    detections: vec![placeholder],
                    frame_path,
                })
            }
            DetectOutcome::Detected {
                detections,
                tracking,
            } => {
                let detections = detections
                    .into_iter()
                    .map(|d| {
                        let u = f64::from(d.bbox.x1 + d.bbox.x2) / 2.0;
                        let v = f64::from(d.bbox.y1 + d.bbox.y2) / 2.0;
                        Detection {
                            position_3d: project(u, v, width, height, center_depth, &pose),
                            label: d.label,
                            confidence: d.confidence,
                            track_id: d.track_id,
                            bbox: d.bbox,
                            frame_path: frame_path.clone(),
                            scan_id: scan_id.to_string(),
                        }
                    })
                    .collect();
                Ok(FrameOutcome::Detected {
                    detections,
                    frame_path,
                    tracking,
                })
            }
        }
    }

    /// Padded crops for `detections`, using the configured minimum size.
    pub fn crop_detections(&self, image_bytes: &[u8], detections: &[Detection]) -> Vec<Option<Vec<u8>>> {
        crop_detections(image_bytes, detections, self.config.min_crop_size)
    }

    fn persist(&self, frame: &RgbImage, scan_id: &str) -> Result<PathBuf, PerceptionError> {
        let dir = self.config.frames_dir.join(scan_dir_name(scan_id));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("frame_{}.jpg", Uuid::new_v4().simple()));
        // Existing frames are never overwritten.
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.config.jpeg_quality).encode_image(frame)?;
        writer.flush()?;
        Ok(path)
    }
}

/// Directory name for a scan: anything outside `[A-Za-z0-9_-]` becomes `_`
/// so an opaque scan id cannot escape `frames_dir`.
pub fn scan_dir_name(scan_id: &str) -> String {
    let cleaned: String = scan_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cropping
// ─────────────────────────────────────────────────────────────────────────────

/// Cut one JPEG crop per detection, padded by [`CROP_PADDING`] on each side
/// and clipped to the frame.
///
/// A slot is `None` when the clipped box is narrower or shorter than
/// `min_size`, or when the frame itself cannot be decoded.  The output always
/// has one slot per input detection, in order.
pub fn crop_detections(image_bytes: &[u8], detections: &[Detection], min_size: u32) -> Vec<Option<Vec<u8>>> {
    let frame = match image::load_from_memory(image_bytes) {
        Ok(img) => img.to_rgb8(),
        Err(_) => return vec![None; detections.len()],
    };
    let (img_w, img_h) = frame.dimensions();
    detections
        .iter()
        .map(|d| crop_one(&frame, &d.bbox, img_w, img_h, min_size))
        .collect()
}

fn crop_one(frame: &RgbImage, bbox: &BoundingBox, img_w: u32, img_h: u32, min_size: u32) -> Option<Vec<u8>> {
    let pad_x = (f64::from(bbox.width()) * CROP_PADDING) as i64;
    let pad_y = (f64::from(bbox.height()) * CROP_PADDING) as i64;
    let x1 = (i64::from(bbox.x1) - pad_x).max(0);
    let y1 = (i64::from(bbox.y1) - pad_y).max(0);
    let x2 = (i64::from(bbox.x2) + pad_x).min(i64::from(img_w));
    let y2 = (i64::from(bbox.y2) + pad_y).min(i64::from(img_h));

    let min = i64::from(min_size);
    if x2 - x1 < min || y2 - y1 < min {
        return None;
    }

    let crop = imageops::crop_imm(frame, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).to_image();
    let mut buf = Cursor::new(Vec::new());
    let encoded = JpegEncoder::new(&mut buf).encode_image(&crop);
    match encoded {
        Ok(()) => Some(buf.into_inner()),
        Err(e) => {
            warn!(error = %e, "failed to encode crop");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detector::testing::{raw, scripted_detector};
    use crate::detector::{DetectionModel, InferenceParams, LoadResult};

    /// Loads fine, then fails every inference call.
    struct FailingModel;

    impl DetectionModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        fn class_name(&self, _class_id: usize) -> Option<&str> {
            None
        }

        fn infer(
            &mut self,
            _frame: &RgbImage,
            _params: &InferenceParams<'_>,
        ) -> Result<Vec<crate::detector::RawDetection>, PerceptionError> {
            Err(PerceptionError::Inference("cuda oom".to_string()))
        }
    }

    fn failing_detector() -> Detector {
        Detector::new(
            DetectorConfig::default(),
            Box::new(|_: &DetectorConfig| -> LoadResult { Ok(Box::new(FailingModel)) }),
        )
    }

    fn files_under(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }
    use image::{ImageFormat, Rgb};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn processor(dir: &Path, detector: Detector) -> FrameProcessor {
        FrameProcessor::new(
            FrameProcessorConfig {
                frames_dir: dir.to_path_buf(),
                ..FrameProcessorConfig::default()
            },
            detector,
        )
    }

    fn detection(bbox: BoundingBox) -> Detection {
        Detection {
            label: "cup".to_string(),
            confidence: 0.9,
            track_id: None,
            bbox,
            position_3d: Position3::default(),
            frame_path: PathBuf::new(),
            scan_id: "s1".to_string(),
        }
    }

    const IDENTITY: &str = "1,0,0,0,0,1,0,0,0,0,1,0,0,0,0,1";

    // ── process ──────────────────────────────────────────────────────────────

    #[test]
    fn persisted_frame_decodes_to_same_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), Detector::without_model(DetectorConfig::default()));
        let out = fp.process(&png(64, 48), 1.0, IDENTITY, "s1", true).unwrap();

        let path = out.frame_path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path().join("s1")));
        assert!(path.exists());
        let back = image::open(&path).unwrap();
        assert_eq!((back.width(), back.height()), (64, 48));
    }

    #[test]
    fn garbage_bytes_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), Detector::without_model(DetectorConfig::default()));
        let out = fp.process(b"definitely not an image", 1.0, IDENTITY, "s1", true).unwrap();
        assert_eq!(out, FrameOutcome::Undecodable);
        assert_eq!(out.into_parts(), (Vec::new(), None));
        assert!(!dir.path().join("s1").exists());
    }

    #[test]
    fn detection_can_be_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), Detector::without_model(DetectorConfig::default()));
        let out = fp.process(&png(32, 32), 1.0, IDENTITY, "s1", false).unwrap();
        let (dets, path) = out.into_parts();
        assert!(dets.is_empty());
        assert!(path.unwrap().exists());
    }

    #[test]
    fn missing_model_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), Detector::without_model(DetectorConfig::default()));
        let out = fp.process(&png(64, 48), 2.0, IDENTITY, "s1", true).unwrap();
        assert!(matches!(out, FrameOutcome::Degraded { .. }));

        let (dets, path) = out.into_parts();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!(d.is_unprocessed());
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.track_id, None);
        assert_eq!(d.bbox, BoundingBox::new(0, 0, 64, 48));
        assert_eq!(d.position_3d, Position3::new(0.0, 0.0, 2.0));
        assert_eq!(Some(d.frame_path.clone()), path);
    }

    #[test]
    fn failed_inference_keeps_the_persisted_frame() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), failing_detector());
        let out = fp.process(&png(64, 48), 1.0, IDENTITY, "s1", true).unwrap();
        assert!(matches!(out, FrameOutcome::Degraded { .. }));

        let (dets, path) = out.into_parts();
        let path = path.unwrap();
        assert!(path.exists());
        assert_eq!(files_under(&dir.path().join("s1")), 1);
        assert_eq!(dets.len(), 1);
        assert!(dets[0].is_unprocessed());
        assert_eq!(dets[0].frame_path, path);
    }

    #[test]
    fn every_frame_gets_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let fp = processor(dir.path(), Detector::without_model(DetectorConfig::default()));
        let a = fp.process(&png(16, 16), 1.0, IDENTITY, "s1", false).unwrap();
        let b = fp.process(&png(16, 16), 1.0, IDENTITY, "s1", false).unwrap();
        let (a, b) = (a.frame_path().unwrap(), b.frame_path().unwrap());
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name.len(), "frame_.jpg".len() + 32);
        assert_eq!(files_under(&dir.path().join("s1")), 2);
    }

    #[test]
    fn centred_detection_projects_straight_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [22.0, 14.0, 42.0, 34.0])],
        );
        let fp = processor(dir.path(), det);
        let out = fp.process(&png(64, 48), 1.5, IDENTITY, "s1", true).unwrap();
        let (dets, path) = out.into_parts();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "cup");
        assert_eq!(dets[0].track_id, Some(1));
        assert_eq!(dets[0].position_3d, Position3::new(0.0, 0.0, -1.5));
        assert_eq!(Some(dets[0].frame_path.clone()), path);
        assert_eq!(dets[0].scan_id, "s1");
    }

    #[test]
    fn malformed_pose_uses_identity() {
        let dir = tempfile::tempdir().unwrap();
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [22.0, 14.0, 42.0, 34.0])],
        );
        let fp = processor(dir.path(), det);
        let out = fp.process(&png(64, 48), 1.5, "not,numbers", "s1", true).unwrap();
        assert_eq!(out.detections()[0].position_3d, Position3::new(0.0, 0.0, -1.5));
        // A second bad pose must not panic or error either.
        fp.process(&png(64, 48), 1.5, "1,2,3", "s1", true).unwrap();
    }

    #[test]
    fn pose_translation_moves_detection() {
        let dir = tempfile::tempdir().unwrap();
        let det = scripted_detector(
            DetectorConfig::default(),
            vec![raw(41, 0.9, [22.0, 14.0, 42.0, 34.0])],
        );
        let fp = processor(dir.path(), det);
        let pose = "1,0,0,0, 0,1,0,0, 0,0,1,0, 1,2,3,1";
        let out = fp.process(&png(64, 48), 1.5, pose, "s1", true).unwrap();
        assert_eq!(out.detections()[0].position_3d, Position3::new(1.0, 2.0, 1.5));
    }

    #[test]
    fn scan_id_cannot_escape_frames_dir() {
        assert_eq!(scan_dir_name("../etc"), "___etc");
        assert_eq!(scan_dir_name("scan-01_a"), "scan-01_a");
        assert_eq!(scan_dir_name(""), "_");
    }

    // ── crop_detections ──────────────────────────────────────────────────────

    #[test]
    fn crops_preserve_order_and_length() {
        let bytes = png(200, 100);
        let dets = vec![
            detection(BoundingBox::new(10, 10, 90, 90)),
            detection(BoundingBox::new(0, 0, 20, 20)),
            detection(BoundingBox::new(100, 20, 180, 80)),
        ];
        let crops = crop_detections(&bytes, &dets, 32);
        assert_eq!(crops.len(), 3);
        assert!(crops[0].is_some());
        assert!(crops[1].is_none());
        assert!(crops[2].is_some());
    }

    #[test]
    fn crop_is_padded_and_clipped() {
        let bytes = png(200, 100);
        // pad = 8 px each side: 52..148 wide, 2..98 tall.
        let dets = vec![detection(BoundingBox::new(60, 10, 140, 90))];
        let crop = crop_detections(&bytes, &dets, 32).remove(0).unwrap();
        let img = image::load_from_memory(&crop).unwrap();
        assert_eq!((img.width(), img.height()), (96, 96));

        // Near the edge the padded box is clipped to the frame.
        let dets = vec![detection(BoundingBox::new(0, 0, 50, 50))];
        let crop = crop_detections(&bytes, &dets, 32).remove(0).unwrap();
        let img = image::load_from_memory(&crop).unwrap();
        assert_eq!((img.width(), img.height()), (55, 55));
    }

    #[test]
    fn padding_can_lift_a_box_over_the_minimum() {
        let bytes = png(200, 100);
        // 30 px box + 3 px pad each side = 36 px.
        let dets = vec![detection(BoundingBox::new(50, 30, 80, 60))];
        assert!(crop_detections(&bytes, &dets, 32)[0].is_some());
    }

    #[test]
    fn undecodable_frame_gives_all_none() {
        let dets = vec![detection(BoundingBox::new(0, 0, 50, 50)); 2];
        assert_eq!(crop_detections(b"junk", &dets, 32), vec![None, None]);
    }
}
