//! Facial landmarks: detector boundary, face selection and depth lifting.

#[cfg(feature = "onnx")]
pub mod onnx;

use std::cmp::Ordering;
use std::ops::Range;
use std::time::Instant;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::capture::{ColorImage, DepthImage};
use crate::geometry::Intrinsics;
use crate::Result;

/// Points produced by the iBUG 68-point model
pub const NUM_FACE_LANDMARKS: usize = 68;

/// Index ranges of the 68-point layout.
pub mod index {
    use super::Range;

    pub const JAW: Range<usize> = 0..17;
    pub const RIGHT_BROW: Range<usize> = 17..22;
    pub const LEFT_BROW: Range<usize> = 22..27;
    pub const NOSE: Range<usize> = 27..36;
    pub const RIGHT_EYE: Range<usize> = 36..42;
    pub const LEFT_EYE: Range<usize> = 42..48;
    pub const MOUTH: Range<usize> = 48..68;

    pub const CHIN: usize = 8;
    pub const NOSE_BRIDGE: usize = 27;
    pub const NOSE_TIP: usize = 30;
    pub const RIGHT_EYE_OUTER: usize = 36;
    pub const LEFT_EYE_OUTER: usize = 45;
}

/// A detected face, in color-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point2<f32> {
        Point2::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clip to an image of the given size.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x = self.x.clamp(0.0, w);
        let y = self.y.clamp(0.0, h);
        Self {
            x,
            y,
            width: (self.x + self.width).clamp(0.0, w) - x,
            height: (self.y + self.height).clamp(0.0, h) - y,
            confidence: self.confidence,
        }
    }
}

/// Face and landmark detector.
///
/// Models are loaded by the constructor of the implementing type, so a
/// detector that exists is ready to run. "No face" is `Ok(vec![])`.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, image: &ColorImage) -> Result<Vec<FaceBox>>;

    /// 2D landmarks for one face, [`NUM_FACE_LANDMARKS`] points in image pixels.
    fn predict_landmarks(&mut self, image: &ColorImage, face: &FaceBox) -> Result<Vec<Point2<f32>>>;
}

impl<T: LandmarkDetector + ?Sized> LandmarkDetector for Box<T> {
    fn detect(&mut self, image: &ColorImage) -> Result<Vec<FaceBox>> {
        (**self).detect(image)
    }

    fn predict_landmarks(&mut self, image: &ColorImage, face: &FaceBox) -> Result<Vec<Point2<f32>>> {
        (**self).predict_landmarks(image, face)
    }
}

/// One detection result, published as a unit.
#[derive(Debug, Clone)]
pub struct Landmarks {
    /// Sequence of the frame these were computed from
    pub frame_sequence: u64,
    pub face: FaceBox,
    pub points_2d: Vec<Point2<f32>>,
    /// Index-aligned with `points_2d`; `None` where depth was missing
    pub points_3d: Vec<Option<Point3<f32>>>,
    pub detected_at: Instant,
}

impl Landmarks {
    pub fn len(&self) -> usize {
        self.points_2d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_2d.is_empty()
    }

    /// 3D points with valid depth, in landmark order.
    pub fn valid_points(&self) -> impl Iterator<Item = (usize, Point3<f32>)> + '_ {
        self.points_3d
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|p| (i, p)))
    }

    pub fn valid_count(&self) -> usize {
        self.points_3d.iter().filter(|p| p.is_some()).count()
    }

    /// Mean of a landmark range in image space
    pub fn centroid_2d(&self, range: Range<usize>) -> Option<Point2<f32>> {
        let pts = self.points_2d.get(range)?;
        if pts.is_empty() {
            return None;
        }
        let n = pts.len() as f32;
        let sum = pts.iter().fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords);
        Some(Point2::from(sum / n))
    }

    /// Mean of the valid 3D points of a range
    pub fn centroid_3d(&self, range: Range<usize>) -> Option<Point3<f32>> {
        let pts: Vec<_> = self.points_3d.get(range)?.iter().flatten().collect();
        if pts.is_empty() {
            return None;
        }
        let n = pts.len() as f32;
        let sum = pts.iter().fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords);
        Some(Point3::from(sum / n))
    }
}

/// Highest confidence above `min_confidence`; ties go to the larger box,
/// then to the earlier one.
pub fn select_face(faces: &[FaceBox], min_confidence: f32) -> Option<FaceBox> {
    faces
        .iter()
        .filter(|f| f.confidence >= min_confidence)
        .fold(None::<&FaceBox>, |best, f| match best {
            None => Some(f),
            Some(b) => {
                let better = match f.confidence.total_cmp(&b.confidence) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => f.area() > b.area(),
                };
                Some(if better { f } else { b })
            }
        })
        .copied()
}

/// Raw depth at `(x, y)`; with `window > 1` the median of the non-zero
/// samples in the surrounding square. Zero means no reading.
pub fn sample_depth(depth: &DepthImage, x: u32, y: u32, window: u32) -> u16 {
    if window <= 1 {
        return depth.get(x, y).unwrap_or(0);
    }
    if x >= depth.width() || y >= depth.height() {
        return 0;
    }
    let r = window / 2;
    let x0 = x.saturating_sub(r);
    let y0 = y.saturating_sub(r);
    let x1 = (x + r).min(depth.width() - 1);
    let y1 = (y + r).min(depth.height() - 1);

    let mut samples: Vec<u16> = (y0..=y1)
        .flat_map(|yy| (x0..=x1).map(move |xx| (xx, yy)))
        .filter_map(|(xx, yy)| depth.get(xx, yy))
        .filter(|&d| d != 0)
        .collect();
    if samples.is_empty() {
        return 0;
    }
    let mid = samples.len() / 2;
    *samples.select_nth_unstable(mid).1
}

/// Back-project 2D landmarks through the depth image.
///
/// The depth image may have a different resolution from the color stream;
/// landmark coordinates are rescaled to it. Points off the image or with
/// zero depth become `None`.
pub fn lift_to_3d(
    points: &[Point2<f32>],
    depth: Option<&DepthImage>,
    intrinsics: &Intrinsics,
    depth_scale_m: f64,
    window: u32,
) -> Vec<Option<Point3<f32>>> {
    let Some(depth) = depth else {
        return vec![None; points.len()];
    };
    let sx = f64::from(depth.width()) / f64::from(intrinsics.width.max(1));
    let sy = f64::from(depth.height()) / f64::from(intrinsics.height.max(1));

    points
        .iter()
        .map(|p| {
            let (x, y) = (f64::from(p.x), f64::from(p.y));
            let (dx, dy) = (x * sx, y * sy);
            if !(dx >= 0.0 && dy >= 0.0) {
                return None;
            }
            let raw = sample_depth(depth, dx as u32, dy as u32, window);
            if raw == 0 {
                return None;
            }
            let q = intrinsics.unproject(x, y, f64::from(raw) * depth_scale_m)?;
            Some(Point3::new(q.x as f32, q.y as f32, q.z as f32))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(conf: f32, size: f32) -> FaceBox {
        FaceBox::new(10.0, 10.0, size, size, conf)
    }

    #[test]
    fn select_prefers_confidence_then_area_then_order() {
        let faces = [face(0.95, 50.0), face(0.99, 20.0), face(0.99, 20.0)];
        assert_eq!(select_face(&faces, 0.9), Some(faces[1]));

        let faces = [face(0.97, 40.0), face(0.97, 80.0)];
        assert_eq!(select_face(&faces, 0.9).map(|f| f.width), Some(80.0));

        let first = FaceBox::new(0.0, 0.0, 30.0, 30.0, 0.95);
        let second = FaceBox::new(100.0, 0.0, 30.0, 30.0, 0.95);
        assert_eq!(select_face(&[first, second], 0.9), Some(first));
    }

    #[test]
    fn low_confidence_faces_are_ignored() {
        assert_eq!(select_face(&[face(0.5, 100.0)], 0.9), None);
        assert_eq!(select_face(&[], 0.0), None);
    }

    #[test]
    fn lift_uses_pinhole_model() {
        let intr = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let depth = DepthImage::filled(640, 480, 1000);
        let pts = [Point2::new(420.0, 140.0), Point2::new(-5.0, 10.0), Point2::new(700.0, 10.0)];

        let lifted = lift_to_3d(&pts, Some(&depth), &intr, 0.001, 1);
        let p = lifted[0].unwrap();
        assert!((p.z - 1.0).abs() < 1e-6);
        assert!((p.x - 0.2).abs() < 1e-6);
        assert!((p.y + 0.2).abs() < 1e-6);
        assert!(lifted[1].is_none());
        assert!(lifted[2].is_none());
    }

    #[test]
    fn zero_depth_gives_no_points() {
        let intr = Intrinsics::mirror_camera();
        let depth = DepthImage::filled(640, 480, 0);
        let pts = vec![Point2::new(100.0, 100.0); NUM_FACE_LANDMARKS];
        let lifted = lift_to_3d(&pts, Some(&depth), &intr, 0.001, 3);
        assert_eq!(lifted.len(), NUM_FACE_LANDMARKS);
        assert!(lifted.iter().all(Option::is_none));
        assert!(lift_to_3d(&pts, None, &intr, 0.001, 1).iter().all(Option::is_none));
    }

    #[test]
    fn window_median_skips_holes() {
        let mut samples = vec![0u16; 9];
        samples[0] = 900;
        samples[2] = 1000;
        samples[8] = 1100;
        let depth = DepthImage::new(3, 3, samples).unwrap();
        assert_eq!(sample_depth(&depth, 1, 1, 1), 0);
        assert_eq!(sample_depth(&depth, 1, 1, 3), 1000);
    }

    #[test]
    fn depth_at_lower_resolution_is_rescaled() {
        let intr = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let mut samples = vec![0u16; 320 * 240];
        samples[120 * 320 + 160] = 2000;
        let depth = DepthImage::new(320, 240, samples).unwrap();
        let lifted = lift_to_3d(&[Point2::new(320.0, 240.0)], Some(&depth), &intr, 0.001, 1);
        let p = lifted[0].unwrap();
        assert!((p.z - 2.0).abs() < 1e-6);
        assert!(p.x.abs() < 1e-6);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = face(1.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&FaceBox::new(100.0, 100.0, 5.0, 5.0, 1.0)), 0.0);
    }
}
