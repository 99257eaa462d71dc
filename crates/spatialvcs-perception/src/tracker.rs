//! Greedy IoU multi-object tracker.
//!
//! A lightweight ByteTrack-style associator: each frame's boxes are matched
//! to live tracks of the same class by descending IoU, unmatched boxes open
//! new tracks, and tracks unseen for more than `max_age` frames are retired.
//! Identities start at 1 and are never reused within one tracker.

use thiserror::Error;

use crate::config::TrackerConfig;

/// Raised when a tracker cannot be built from its configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("iou_threshold must be in (0, 1], got {0}")]
    InvalidIouThreshold(f32),
    #[error("max_age must be at least 1")]
    InvalidMaxAge,
}

/// Intersection-over-union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    class_id: usize,
    xyxy: [f32; 4],
    last_seen: u64,
}

/// Per-scan identity associator.
#[derive(Debug)]
pub struct IouTracker {
    iou_threshold: f32,
    max_age: u32,
    tracks: Vec<Track>,
    next_id: u32,
    frame: u64,
}

impl IouTracker {
    /// Build a tracker, validating `cfg`.
    pub fn new(cfg: &TrackerConfig) -> Result<Self, TrackerError> {
        if !(cfg.iou_threshold > 0.0 && cfg.iou_threshold <= 1.0) {
            return Err(TrackerError::InvalidIouThreshold(cfg.iou_threshold));
        }
        if cfg.max_age == 0 {
            return Err(TrackerError::InvalidMaxAge);
        }
        Ok(Self {
            iou_threshold: cfg.iou_threshold,
            max_age: cfg.max_age,
            tracks: Vec::new(),
            next_id: 1,
            frame: 0,
        })
    }

    /// Associate one frame of `(class_id, xyxy)` boxes and return one track
    /// id per box, in input order.
    pub fn update(&mut self, boxes: &[(usize, [f32; 4])]) -> Vec<u32> {
        self.frame += 1;

        // Candidate pairs above threshold, best overlap first.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (bi, (class_id, xyxy)) in boxes.iter().enumerate() {
                if track.class_id != *class_id {
                    continue;
                }
                let overlap = iou(&track.xyxy, xyxy);
                if overlap >= self.iou_threshold {
                    pairs.push((overlap, ti, bi));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<u32>> = vec![None; boxes.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, ti, bi) in pairs {
            if track_taken[ti] || assigned[bi].is_some() {
                continue;
            }
            track_taken[ti] = true;
            let track = &mut self.tracks[ti];
            track.xyxy = boxes[bi].1;
            track.last_seen = self.frame;
            assigned[bi] = Some(track.id);
        }

        let ids = assigned
            .into_iter()
            .zip(boxes)
            .map(|(slot, (class_id, xyxy))| match slot {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        class_id: *class_id,
                        xyxy: *xyxy,
                        last_seen: self.frame,
                    });
                    id
                }
            })
            .collect();

        let frame = self.frame;
        let max_age = u64::from(self.max_age);
        self.tracks.retain(|t| frame - t.last_seen <= max_age);
        ids
    }

    /// Number of live tracks.
    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}
