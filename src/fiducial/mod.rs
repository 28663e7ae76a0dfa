//! Fiducial marker boundary and marker-to-camera pose.

use image::GrayImage;
use nalgebra::{Matrix3, Matrix4, Point2, Vector3};

use crate::geometry::{planar_marker_pose, yaw_pitch_roll, Intrinsics, RigidPose};
use crate::Result;

/// The four corners of a detected marker, in pixels
pub type MarkerCorners = [Point2<f32>; 4];

/// A detected marker.
///
/// Corners run top-left, top-right, bottom-right, bottom-left in the
/// marker's own frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDetection {
    pub id: u32,
    pub corners: MarkerCorners,
    /// Bits corrected while decoding
    pub hamming: u32,
}

/// Marker frame convention fix applied before publishing: y axis flipped.
pub fn axis_flip() -> Matrix3<f64> {
    Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, 1.0))
}

impl MarkerDetection {
    /// Rotation and translation marker -> camera, in metres.
    pub fn relative_pose(&self, marker_size_m: f64, intrinsics: &Intrinsics) -> Result<RigidPose> {
        let corners = self
            .corners
            .map(|c| Point2::new(f64::from(c.x), f64::from(c.y)));
        planar_marker_pose(&corners, marker_size_m, intrinsics)
    }
}

/// Marker pose in the convention the renderer consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerPose {
    pub id: u32,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl MarkerPose {
    pub fn from_detection(det: &MarkerDetection, marker_size_m: f64, intrinsics: &Intrinsics) -> Result<Self> {
        let raw = det.relative_pose(marker_size_m, intrinsics)?;
        Ok(Self {
            id: det.id,
            rotation: axis_flip() * raw.rotation,
            translation: raw.translation,
        })
    }

    /// 4x4 extrinsics, rotation in the upper-left block and translation in the last column.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        RigidPose {
            rotation: self.rotation,
            translation: self.translation,
        }
        .to_matrix()
    }

    pub fn yaw_pitch_roll(&self) -> (f64, f64, f64) {
        yaw_pitch_roll(&self.rotation)
    }
}

/// Fiducial marker detector working on grayscale frames.
///
/// "No marker" is `Ok(vec![])`.
pub trait MarkerDetector: Send {
    fn extract_markers(&mut self, gray: &GrayImage) -> Result<Vec<MarkerDetection>>;
}

impl<T: MarkerDetector + ?Sized> MarkerDetector for Box<T> {
    fn extract_markers(&mut self, gray: &GrayImage) -> Result<Vec<MarkerDetection>> {
        (**self).extract_markers(gray)
    }
}
