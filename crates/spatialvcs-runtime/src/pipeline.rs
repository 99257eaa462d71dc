//! End-to-end ingest and query.
//!
//! [`SpatialPipeline::ingest_frame`] runs one frame through the Frame
//! Processor, describes what was found, and writes one observation per
//! object into the Spatial Memory Store.  [`SpatialPipeline::ask`] is the
//! read side.
//!
//! Each stored observation carries this metadata:
//!
//! | key           | value                                              |
//! |---------------|----------------------------------------------------|
//! | `scan_id`     | scan the frame belongs to                          |
//! | `label`       | detector class, or object name from the describer  |
//! | `track_id`    | tracker identity, `-1` when untracked              |
//! | `confidence`  | detector confidence (detections only)              |
//! | `bbox`        | `[x1, y1, x2, y2]` (detections only)               |
//! | `position_3d` | `{x, y, z}` world position                         |
//! | `frame_path`  | persisted source frame                             |
//! | `timestamp`   | RFC 3339, UTC                                      |
//! | `kind`        | `object`, `scene` or `scene_object`                |

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use spatialvcs_memory::{AddOutcome, SearchHit, SpatialMemory};
use spatialvcs_perception::transform::Pose;
use spatialvcs_perception::{FrameOutcome, FrameProcessor};
use spatialvcs_types::{Detection, Metadata, Position3, SpatialError, track_id};
use tracing::{info, instrument, warn};

use crate::collab::{Describer, SceneDescription, SceneObject, SpatialDiff};

/// Observation produced from one detector box.
pub const KIND_OBJECT: &str = "object";
/// Whole-frame summary from the describer.
pub const KIND_SCENE: &str = "scene";
/// Object listed in a whole-frame description.
pub const KIND_SCENE_OBJECT: &str = "scene_object";

/// What one call to [`SpatialPipeline::ingest_frame`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// `None` when the payload was not a decodable image.
    pub frame_path: Option<PathBuf>,
    /// Boxes reported by the detector for this frame.
    pub detections: usize,
    /// Ids of the observations written.
    pub stored: Vec<String>,
    /// Observations dropped because the describer or the store was unavailable.
    pub skipped: usize,
    /// The detector had no model and returned a placeholder.
    pub degraded: bool,
}

/// Frame processor, memory store and (optionally) a describer, wired together.
pub struct SpatialPipeline {
    processor: FrameProcessor,
    memory: SpatialMemory,
    describer: Option<Box<dyn Describer>>,
}

impl SpatialPipeline {
    /// Without a describer, detections are stored under their class label
    /// and whole-frame ingests store nothing.
    pub fn new(
        processor: FrameProcessor,
        memory: SpatialMemory,
        describer: Option<Box<dyn Describer>>,
    ) -> Self {
        Self {
            processor,
            memory,
            describer,
        }
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    pub fn memory(&self) -> &SpatialMemory {
        &self.memory
    }

    pub fn has_describer(&self) -> bool {
        self.describer.is_some()
    }

    /// Process, describe and remember one frame.
    #[instrument(skip(self, image, pose_text), fields(bytes = image.len()))]
    pub fn ingest_frame(
        &self,
        image: &[u8],
        center_depth: f64,
        pose_text: &str,
        scan_id: &str,
        run_detection: bool,
    ) -> Result<IngestReport, SpatialError> {
        let outcome = self
            .processor
            .process(image, center_depth, pose_text, scan_id, run_detection)?;
        let timestamp = Utc::now().to_rfc3339();

        let mut report = IngestReport::default();
        match outcome {
            FrameOutcome::Undecodable => {
                warn!(scan_id, "frame payload could not be decoded");
                return Ok(report);
            }
            FrameOutcome::Persisted { frame_path } => {
                let camera = Pose::parse_or_identity(pose_text).0.translation();
                self.store_scene(image, scan_id, &frame_path, camera, &timestamp, &mut report)?;
                report.frame_path = Some(frame_path);
            }
            FrameOutcome::Degraded {
                detections,
                frame_path,
            } => {
                report.degraded = true;
                report.detections = detections.len();
                let camera = Pose::parse_or_identity(pose_text).0.translation();
                self.store_scene(image, scan_id, &frame_path, camera, &timestamp, &mut report)?;
                report.frame_path = Some(frame_path);
            }
            FrameOutcome::Detected {
                detections,
                frame_path,
                ..
            } => {
                report.detections = detections.len();
                self.store_detections(image, &detections, &timestamp, &mut report)?;
                report.frame_path = Some(frame_path);
            }
        }

        info!(
            scan_id,
            detections = report.detections,
            stored = report.stored.len(),
            skipped = report.skipped,
            "frame ingested"
        );
        Ok(report)
    }

    fn store_detections(
        &self,
        image: &[u8],
        detections: &[Detection],
        timestamp: &str,
        report: &mut IngestReport,
    ) -> Result<(), SpatialError> {
        let crops = self.processor.crop_detections(image, detections);
        for (det, crop) in detections.iter().zip(crops) {
            let text = match (crop, self.describer.as_deref()) {
                (Some(crop), Some(describer)) => match describer.describe_object(&crop, &det.label) {
                    Ok(reply) => format!("{}: {}", det.label, reply.trim()),
                    Err(e) => {
                        warn!(label = %det.label, error = %e, "object description failed; skipping");
                        report.skipped += 1;
                        continue;
                    }
                },
                _ => det.label.clone(),
            };
            self.remember(&text, detection_metadata(det, timestamp), report)?;
        }
        Ok(())
    }

    fn store_scene(
        &self,
        image: &[u8],
        scan_id: &str,
        frame_path: &Path,
        camera: Position3,
        timestamp: &str,
        report: &mut IngestReport,
    ) -> Result<(), SpatialError> {
        let Some(describer) = self.describer.as_deref() else {
            return Ok(());
        };
        let reply = match describer.describe_frame(image) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(scan_id, error = %e, "scene description failed; skipping");
                report.skipped += 1;
                return Ok(());
            }
        };
        let scene = SceneDescription::parse(&reply);
        let base = SceneContext {
            scan_id,
            frame_path,
            camera,
            timestamp,
        };

        if !scene.scene_summary.is_empty() {
            let meta = base.metadata(KIND_SCENE, KIND_SCENE, None);
            self.remember(&scene.scene_summary, meta, report)?;
        }
        for obj in &scene.objects {
            let meta = base.metadata(KIND_SCENE_OBJECT, &obj.name, Some(obj));
            self.remember(&obj.to_text(), meta, report)?;
        }
        Ok(())
    }

    fn remember(
        &self,
        text: &str,
        metadata: Metadata,
        report: &mut IngestReport,
    ) -> Result<(), SpatialError> {
        match self.memory.add_observation(text, &metadata)? {
            AddOutcome::Stored { id } => report.stored.push(id),
            AddOutcome::NotReady => report.skipped += 1,
        }
        Ok(())
    }

    /// Ranked observations matching `query`, optionally within one scan.
    pub fn ask(
        &self,
        query: &str,
        k: usize,
        scan_id: Option<&str>,
    ) -> Result<Vec<SearchHit>, SpatialError> {
        Ok(self.memory.search(query, k, scan_id)?)
    }

    /// Search memory and have the describer phrase an answer from the hits.
    #[instrument(skip(self))]
    pub fn answer(
        &self,
        query: &str,
        k: usize,
        scan_id: Option<&str>,
    ) -> Result<String, SpatialError> {
        let describer = self
            .describer
            .as_deref()
            .ok_or_else(|| SpatialError::Collaborator("no describer configured".to_string()))?;
        let hits = self.memory.search(query, k, scan_id)?;
        let reply = describer.answer(query, &hits)?;
        Ok(reply.trim().to_string())
    }

    /// Objects remembered for `scan_id`, oldest first.
    pub fn snapshot(&self, scan_id: &str) -> Vec<SceneObject> {
        self.memory
            .records()
            .into_iter()
            .filter(|r| r.metadata.get("scan_id").and_then(Value::as_str) == Some(scan_id))
            .filter(|r| {
                matches!(
                    r.metadata.get("kind").and_then(Value::as_str),
                    Some(KIND_OBJECT | KIND_SCENE_OBJECT)
                )
            })
            .map(|r| SceneObject {
                name: r
                    .metadata
                    .get("label")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                position: describe_position(r.metadata.get("position_3d")),
                details: r.text,
            })
            .collect()
    }

    /// Ask the describer what changed between two scans.
    pub fn diff_scans(&self, before: &str, after: &str) -> Result<SpatialDiff, SpatialError> {
        let describer = self
            .describer
            .as_deref()
            .ok_or_else(|| SpatialError::Collaborator("no describer configured".to_string()))?;
        let reply = describer.compare(&self.snapshot(before), &self.snapshot(after))?;
        Ok(SpatialDiff::parse(&reply))
    }

    /// Forget tracker state for a finished scan.
    pub fn end_scan(&self, scan_id: &str) {
        self.processor.detector().end_scan(scan_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata builders
// ─────────────────────────────────────────────────────────────────────────────

fn position_value(p: Position3) -> Value {
    json!({"x": p.x, "y": p.y, "z": p.z})
}

fn describe_position(v: Option<&Value>) -> String {
    let coord = |axis: &str| v.and_then(|p| p.get(axis)).and_then(Value::as_f64);
    match (coord("x"), coord("y"), coord("z")) {
        (Some(x), Some(y), Some(z)) => format!("({x:.2}, {y:.2}, {z:.2})"),
        _ => String::new(),
    }
}

fn detection_metadata(det: &Detection, timestamp: &str) -> Metadata {
    let bbox: [i32; 4] = det.bbox.into();
    let mut m = Metadata::new();
    m.insert("scan_id".into(), Value::from(det.scan_id.as_str()));
    m.insert("label".into(), Value::from(det.label.as_str()));
    m.insert(
        "track_id".into(),
        Value::from(det.track_id.map_or(track_id::UNTRACKED, i64::from)),
    );
    m.insert("confidence".into(), Value::from(f64::from(det.confidence)));
    m.insert("bbox".into(), Value::from(bbox.to_vec()));
    m.insert("position_3d".into(), position_value(det.position_3d));
    m.insert(
        "frame_path".into(),
        Value::from(det.frame_path.display().to_string()),
    );
    m.insert("timestamp".into(), Value::from(timestamp));
    m.insert("kind".into(), Value::from(KIND_OBJECT));
    m
}

struct SceneContext<'a> {
    scan_id: &'a str,
    frame_path: &'a Path,
    camera: Position3,
    timestamp: &'a str,
}

impl SceneContext<'_> {
    fn metadata(&self, kind: &str, label: &str, object: Option<&SceneObject>) -> Metadata {
        let mut m = Metadata::new();
        m.insert("scan_id".into(), Value::from(self.scan_id));
        m.insert("label".into(), Value::from(label));
        m.insert("track_id".into(), Value::from(track_id::UNTRACKED));
        m.insert("position_3d".into(), position_value(self.camera));
        m.insert(
            "frame_path".into(),
            Value::from(self.frame_path.display().to_string()),
        );
        m.insert("timestamp".into(), Value::from(self.timestamp));
        m.insert("kind".into(), Value::from(kind));
        if let Some(obj) = object {
            m.insert("position".into(), Value::from(obj.position.as_str()));
            m.insert("details".into(), Value::from(obj.details.as_str()));
        }
        m
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, RgbImage};
    use spatialvcs_perception::detector::{
        DetectionModel, InferenceParams, LoadResult, RawDetection,
    };
    use spatialvcs_perception::{Detector, DetectorConfig, FrameProcessorConfig, PerceptionError};

    use super::*;
    use crate::collab::CollabError;

    const IDENTITY: &str = "1,0,0,0,0,1,0,0,0,0,1,0,0,0,0,1";

    // ── fixtures ─────────────────────────────────────────────────────────────

    struct FixedModel(Vec<RawDetection>);

    impl DetectionModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn class_name(&self, class_id: usize) -> Option<&str> {
            match class_id {
                41 => Some("cup"),
                56 => Some("chair"),
                _ => None,
            }
        }

        fn infer(
            &mut self,
            _frame: &RgbImage,
            _params: &InferenceParams<'_>,
        ) -> Result<Vec<RawDetection>, PerceptionError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MockDescriber {
        scene_reply: String,
        fail_objects: bool,
    }

    impl Describer for MockDescriber {
        fn describe_frame(&self, _image: &[u8]) -> Result<String, CollabError> {
            Ok(self.scene_reply.clone())
        }

        fn describe_object(&self, _crop: &[u8], label: &str) -> Result<String, CollabError> {
            if self.fail_objects {
                return Err(CollabError::Unavailable("offline".to_string()));
            }
            Ok(match label {
                "cup" => "a red ceramic mug".to_string(),
                _ => format!("a plain {label}"),
            })
        }

        fn answer(&self, query: &str, hits: &[SearchHit]) -> Result<String, CollabError> {
            Ok(match hits.first() {
                Some(best) => format!(" {query}: {} ({} hit(s))\n", best.text, hits.len()),
                None => format!("{query}: nothing remembered"),
            })
        }

        fn compare(
            &self,
            before: &[SceneObject],
            after: &[SceneObject],
        ) -> Result<String, CollabError> {
            assert!(after.len() < before.len());
            Ok("```json\n{\"changes\": [{\"object\": \"cup\", \"action\": \"removed\"}], \"summary\": \"The cup is gone.\"}\n```".to_string())
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, image::Rgb([120, 80, 40]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn raw(class_id: usize, xyxy: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id,
            confidence: 0.9,
            xyxy,
        }
    }

    fn pipeline(
        frames: &Path,
        boxes: Option<Vec<RawDetection>>,
        describer: Option<MockDescriber>,
    ) -> SpatialPipeline {
        let config = DetectorConfig::default();
        let detector = match boxes {
            Some(boxes) => Detector::new(
                config,
                Box::new(move |_: &DetectorConfig| -> LoadResult {
                    Ok(Box::new(FixedModel(boxes.clone())))
                }),
            ),
            None => Detector::without_model(config),
        };
        let processor = FrameProcessor::new(
            FrameProcessorConfig {
                frames_dir: frames.to_path_buf(),
                ..FrameProcessorConfig::default()
            },
            detector,
        );
        SpatialPipeline::new(
            processor,
            SpatialMemory::in_memory(),
            describer.map(|d| Box::new(d) as Box<dyn Describer>),
        )
    }

    // ── ingest ───────────────────────────────────────────────────────────────

    #[test]
    fn detected_objects_are_described_and_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            Some(vec![raw(41, [100.0, 100.0, 200.0, 200.0]), raw(56, [300.0, 50.0, 500.0, 400.0])]),
            Some(MockDescriber::default()),
        );
        let report = p.ingest_frame(&png(640, 480), 1.5, IDENTITY, "s1", true).unwrap();
        assert_eq!(report.detections, 2);
        assert_eq!(report.stored.len(), 2);
        assert!(report.frame_path.as_ref().unwrap().exists());

        let hits = p.ask("mug", 1, Some("s1")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "cup: a red ceramic mug");
        let meta = &hits[0].metadata;
        assert_eq!(meta["kind"], json!("object"));
        assert_eq!(meta["bbox"], json!([100, 100, 200, 200]));
        assert_eq!(meta["track_id"], json!(1));
        assert!(meta["position_3d"]["z"].as_f64().unwrap() < 0.0);
        assert!(meta["timestamp"].as_str().unwrap().contains('T'));
        assert!(p.ask("mug", 1, Some("s2")).unwrap().is_empty());
    }

    #[test]
    fn without_describer_labels_are_stored() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), Some(vec![raw(41, [10.0, 10.0, 90.0, 90.0])]), None);
        let report = p.ingest_frame(&png(320, 240), 1.0, IDENTITY, "s1", true).unwrap();
        assert_eq!(report.stored.len(), 1);
        assert_eq!(p.memory().records()[0].text, "cup");
    }

    #[test]
    fn describer_failure_skips_observation() {
        let dir = tempfile::tempdir().unwrap();
        let describer = MockDescriber {
            fail_objects: true,
            ..MockDescriber::default()
        };
        let p = pipeline(dir.path(), Some(vec![raw(41, [10.0, 10.0, 90.0, 90.0])]), Some(describer));
        let report = p.ingest_frame(&png(320, 240), 1.0, IDENTITY, "s1", true).unwrap();
        assert!(report.stored.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn undecodable_frame_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), Some(vec![]), Some(MockDescriber::default()));
        let report = p.ingest_frame(b"definitely not an image", 1.0, IDENTITY, "s1", true).unwrap();
        assert_eq!(report, IngestReport::default());
        assert!(p.memory().is_empty());
    }

    #[test]
    fn degraded_detector_falls_back_to_scene_description() {
        let dir = tempfile::tempdir().unwrap();
        let describer = MockDescriber {
            scene_reply: "```json\n{\"scene_summary\": \"a tidy desk\", \"objects\": [{\"name\": \"laptop\", \"position\": \"center\"}]}\n```".to_string(),
            ..MockDescriber::default()
        };
        let pose = "1,0,0,0, 0,1,0,0, 0,0,1,0, 2,0,0,1";
        let p = pipeline(dir.path(), None, Some(describer));
        let report = p.ingest_frame(&png(320, 240), 1.0, pose, "s1", true).unwrap();
        assert!(report.degraded);
        assert_eq!(report.stored.len(), 2);

        let records = p.memory().records();
        assert_eq!(records[0].metadata["kind"], json!("scene"));
        assert_eq!(records[1].text, "laptop, center");
        assert_eq!(records[1].metadata["position_3d"]["x"], json!(2.0));
    }

    #[test]
    fn detection_disabled_with_prose_reply_stores_summary_only() {
        let dir = tempfile::tempdir().unwrap();
        let describer = MockDescriber {
            scene_reply: "A cluttered workbench.".to_string(),
            ..MockDescriber::default()
        };
        let p = pipeline(dir.path(), Some(vec![]), Some(describer));
        let report = p.ingest_frame(&png(64, 64), 1.0, IDENTITY, "s1", false).unwrap();
        assert_eq!(report.detections, 0);
        assert_eq!(report.stored.len(), 1);
        assert_eq!(p.memory().records()[0].text, "A cluttered workbench.");
    }

    // ── answer ───────────────────────────────────────────────────────────────

    #[test]
    fn answer_is_phrased_from_scoped_hits() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            Some(vec![raw(41, [10.0, 10.0, 90.0, 90.0])]),
            Some(MockDescriber::default()),
        );
        p.ingest_frame(&png(320, 240), 1.0, IDENTITY, "s1", true).unwrap();

        let reply = p.answer("where is my mug", 3, Some("s1")).unwrap();
        assert_eq!(reply, "where is my mug: cup: a red ceramic mug (1 hit(s))");

        let reply = p.answer("where is my mug", 3, Some("s2")).unwrap();
        assert_eq!(reply, "where is my mug: nothing remembered");
    }

    #[test]
    fn answer_without_describer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), Some(vec![]), None);
        assert!(matches!(p.answer("mug", 3, None), Err(SpatialError::Collaborator(_))));
    }

    // ── diff ─────────────────────────────────────────────────────────────────

    #[test]
    fn diff_compares_scan_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            Some(vec![raw(41, [10.0, 10.0, 90.0, 90.0])]),
            Some(MockDescriber::default()),
        );
        p.ingest_frame(&png(320, 240), 1.0, IDENTITY, "before", true).unwrap();
        assert_eq!(p.snapshot("before").len(), 1);
        assert!(p.snapshot("after").is_empty());

        let diff = p.diff_scans("before", "after").unwrap();
        assert_eq!(diff.change_count, 1);
        assert_eq!(diff.summary, "The cup is gone.");
    }

    #[test]
    fn diff_without_describer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), Some(vec![]), None);
        assert!(matches!(p.diff_scans("a", "b"), Err(SpatialError::Collaborator(_))));
    }
}
