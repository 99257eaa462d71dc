//! Pose parsing and camera-to-world projection.
//!
//! The probe reports its pose as 16 comma-separated floats in row-major text
//! order.  The values are reshaped to a 4×4 matrix and then **transposed**;
//! the resulting matrix maps a homogeneous camera-space point to world space
//! by left multiplication (`world = pose · camera`).  Probes emit the matrix
//! column-major, so the transpose is what places the translation in the last
//! column.  Keep this convention exactly: every stored `position_3d` depends on
//! it.
//!
//! # Example
//!
//! ```rust
//! use spatialvcs_perception::transform::{project, Pose};
//!
//! // Camera sitting 2 m along +X in world space.
//! let pose = Pose::parse("1,0,0,0, 0,1,0,0, 0,0,1,0, 2,0,0,1").unwrap();
//!
//! // Object at the principal point of a 640×480 frame, 1.5 m away.
//! let p = project(320.0, 240.0, 640, 480, 1.5, &pose);
//! assert!((p.x - 2.0).abs() < 1e-12);
//! assert!((p.z + 1.5).abs() < 1e-12);
//! ```

use spatialvcs_types::Position3;
use thiserror::Error;

/// Focal length as a multiple of image width for the pinhole approximation.
pub const FOCAL_WIDTH_RATIO: f64 = 1.5;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Why a pose string was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseParseError {
    #[error("pose value #{index} is not a number: {token:?}")]
    NotNumeric { index: usize, token: String },
    #[error("pose must have 16 values, got {0}")]
    WrongLength(usize),
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A 4×4 rigid transform from camera space to world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// `m[row][col]`, already transposed from the wire order.
    m: [[f64; 4]; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// The identity transform (camera frame == world frame).
    pub fn identity() -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { m }
    }

    /// Reshape 16 row-major values to 4×4 and transpose.
    pub fn from_row_major(values: [f64; 16]) -> Self {
        let mut m = [[0.0; 4]; 4];
        for (row, chunk) in values.chunks_exact(4).enumerate() {
            for (col, v) in chunk.iter().enumerate() {
                // transpose: wire (row, col) lands at (col, row)
                m[col][row] = *v;
            }
        }
        Self { m }
    }

    /// Parse the wire form: 16 comma-separated decimals.
    ///
    /// Whitespace around each value is ignored.
    pub fn parse(text: &str) -> Result<Self, PoseParseError> {
        let mut values = Vec::with_capacity(16);
        for (index, token) in text.split(',').enumerate() {
            let token = token.trim();
            let v = token.parse::<f64>().map_err(|_| PoseParseError::NotNumeric {
                index,
                token: token.to_string(),
            })?;
            values.push(v);
        }
        let values: [f64; 16] = values
            .try_into()
            .map_err(|v: Vec<f64>| PoseParseError::WrongLength(v.len()))?;
        Ok(Self::from_row_major(values))
    }

    /// Parse `text`, substituting the identity transform on any error.
    ///
    /// The error is handed back alongside so the caller can decide how loudly
    /// to report it; frame processing itself never stops for a bad pose.
    pub fn parse_or_identity(text: &str) -> (Self, Option<PoseParseError>) {
        match Self::parse(text) {
            Ok(p) => (p, None),
            Err(e) => (Self::identity(), Some(e)),
        }
    }

    /// The matrix in application order (`m[row][col]`).
    pub fn matrix(&self) -> &[[f64; 4]; 4] {
        &self.m
    }

    /// Matrix–vector product `pose · p`.
    pub fn apply(&self, p: [f64; 4]) -> [f64; 4] {
        let mut out = [0.0; 4];
        for (row, o) in out.iter_mut().enumerate() {
            *o = self.m[row]
                .iter()
                .zip(p.iter())
                .map(|(a, b)| a * b)
                .sum();
        }
        out
    }

    /// World-space translation of the camera origin.
    pub fn translation(&self) -> Position3 {
        Position3::new(self.m[0][3], self.m[1][3], self.m[2][3])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pinhole projection
// ────────────────────────────────────────────────────────────────────────────

/// Pinhole intrinsics derived from image size alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// `fx = fy = 1.5 × width`, principal point at the image centre.
    pub fn for_image(width: u32, height: u32) -> Self {
        let fx = f64::from(width) * FOCAL_WIDTH_RATIO;
        Self {
            fx,
            fy: fx,
            cx: f64::from(width) / 2.0,
            cy: f64::from(height) / 2.0,
        }
    }

    /// Back-project pixel `(u, v)` at `depth` metres into camera space.
    ///
    /// The camera looks down −Z with +Y up, so image rows grow downward and
    /// the depth axis is negated.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> [f64; 4] {
        let zc = -depth;
        let xc = (u - self.cx) * depth / self.fx;
        let yc = -(v - self.cy) * depth / self.fy;
        [xc, yc, zc, 1.0]
    }
}

/// Map an image-space detection centre into world space.
///
/// Total for finite inputs; a zero depth collapses the point onto the camera
/// origin.
pub fn project(u: f64, v: f64, width: u32, height: u32, depth: f64, pose: &Pose) -> Position3 {
    let cam = Intrinsics::for_image(width, height).unproject(u, v, depth);
    let world = pose.apply(cam);
    Position3::new(world[0], world[1], world[2])
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
