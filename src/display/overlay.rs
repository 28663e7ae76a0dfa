//! Overlay geometry for the render thread. Pure math, no GPU handles.

use std::sync::Arc;

use nalgebra::{Matrix4, Point2, Point3, Vector3, Vector4};

use crate::geometry::Intrinsics;
use crate::landmarks::{index, Landmarks};
use crate::pipeline::RenderSnapshot;

pub type Rgb = [u8; 3];

pub const LANDMARK_COLOR: Rgb = [255, 64, 64];
pub const VELOCITY_COLOR: Rgb = [255, 255, 0];
pub const GLASSES_COLOR: Rgb = [40, 40, 40];
const AXIS_COLORS: [Rgb; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];

/// A line in color-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub a: Point2<f32>,
    pub b: Point2<f32>,
    pub color: Rgb,
}

/// Everything to draw on top of the camera image for one tick.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub points: Vec<Point2<f32>>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy)]
pub struct OverlayOptions {
    pub debug: bool,
    pub near_m: f64,
    pub far_m: f64,
    pub axis_length_m: f64,
    /// Velocity vectors are drawn this many times their per-detection length
    pub velocity_gain: f32,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            debug: false,
            near_m: 0.01,
            far_m: 10.0,
            axis_length_m: 0.05,
            velocity_gain: 3.0,
        }
    }
}

/// Projection * extrinsics
pub fn model_view_projection(intrinsics: &Intrinsics, extrinsics: &Matrix4<f64>, near: f64, far: f64) -> Matrix4<f64> {
    intrinsics.projection_matrix(near, far) * extrinsics
}

/// Model-space point to image pixel. `None` if behind the camera or clipped in depth.
pub fn project_mvp(mvp: &Matrix4<f64>, intrinsics: &Intrinsics, p: &Point3<f64>) -> Option<Point2<f32>> {
    let clip = mvp * Vector4::new(p.x, p.y, p.z, 1.0);
    if clip.w <= 1e-9 {
        return None;
    }
    let ndc = clip.xyz() / clip.w;
    if !(-1.0..=1.0).contains(&ndc.z) {
        return None;
    }
    let px = intrinsics.ndc_to_pixel(ndc.x, ndc.y);
    Some(Point2::new(px.x as f32, px.y as f32))
}

fn segment(mvp: &Matrix4<f64>, intr: &Intrinsics, a: Point3<f64>, b: Point3<f64>, color: Rgb) -> Option<Segment> {
    Some(Segment {
        a: project_mvp(mvp, intr, &a)?,
        b: project_mvp(mvp, intr, &b)?,
        color,
    })
}

/// X/Y/Z axes of the marker frame, red/green/blue.
pub fn axes_gizmo(mvp: &Matrix4<f64>, intrinsics: &Intrinsics, length: f64) -> Vec<Segment> {
    let o = Point3::origin();
    [Vector3::x(), Vector3::y(), Vector3::z()]
        .iter()
        .zip(AXIS_COLORS)
        .filter_map(|(axis, color)| segment(mvp, intrinsics, o, o + axis * length, color))
        .collect()
}

/// Wireframe glasses anchored on the eye landmarks.
///
/// Uses the 3D eye centres when depth is available, otherwise a flat frame
/// around the 2D eye centres.
pub fn glasses_wireframe(landmarks: &Landmarks, intrinsics: &Intrinsics, near: f64, far: f64) -> Vec<Segment> {
    let right_3d = landmarks.centroid_3d(index::RIGHT_EYE);
    let left_3d = landmarks.centroid_3d(index::LEFT_EYE);
    if let (Some(r), Some(l)) = (right_3d, left_3d) {
        let to_f64 = |p: Point3<f32>| Point3::new(f64::from(p.x), f64::from(p.y), f64::from(p.z));
        return glasses_3d(to_f64(r), to_f64(l), intrinsics, near, far);
    }

    let (Some(r), Some(l)) = (
        landmarks.centroid_2d(index::RIGHT_EYE),
        landmarks.centroid_2d(index::LEFT_EYE),
    ) else {
        return Vec::new();
    };
    let half_w = (l - r).norm() * 0.3;
    let half_h = half_w * 0.7;
    let mut segs = Vec::new();
    for c in [r, l] {
        let corners = [
            Point2::new(c.x - half_w, c.y - half_h),
            Point2::new(c.x + half_w, c.y - half_h),
            Point2::new(c.x + half_w, c.y + half_h),
            Point2::new(c.x - half_w, c.y + half_h),
        ];
        for i in 0..4 {
            segs.push(Segment {
                a: corners[i],
                b: corners[(i + 1) % 4],
                color: GLASSES_COLOR,
            });
        }
    }
    // Bridge between the inner rims
    let (inner_r, inner_l) = if r.x < l.x {
        (r.x + half_w, l.x - half_w)
    } else {
        (r.x - half_w, l.x + half_w)
    };
    segs.push(Segment {
        a: Point2::new(inner_r, r.y - half_h * 0.5),
        b: Point2::new(inner_l, l.y - half_h * 0.5),
        color: GLASSES_COLOR,
    });
    segs
}

fn glasses_3d(right: Point3<f64>, left: Point3<f64>, intr: &Intrinsics, near: f64, far: f64) -> Vec<Segment> {
    let span = left - right;
    let ipd = span.norm();
    if ipd < 1e-4 {
        return Vec::new();
    }
    let u = span / ipd;
    let down = Vector3::y();
    let v = (down - u * down.dot(&u)).normalize();
    let mut w = u.cross(&v);
    if w.z < 0.0 {
        w = -w;
    }

    let half_w = ipd * 0.3;
    let half_h = half_w * 0.7;
    let mvp = model_view_projection(intr, &Matrix4::identity(), near, far);

    let mut segs = Vec::new();
    for c in [right, left] {
        let corners = [
            c - u * half_w - v * half_h,
            c + u * half_w - v * half_h,
            c + u * half_w + v * half_h,
            c - u * half_w + v * half_h,
        ];
        for i in 0..4 {
            segs.extend(segment(&mvp, intr, corners[i], corners[(i + 1) % 4], GLASSES_COLOR));
        }
    }

    let bridge_a = right + u * half_w - v * half_h * 0.5;
    let bridge_b = left - u * half_w - v * half_h * 0.5;
    segs.extend(segment(&mvp, intr, bridge_a, bridge_b, GLASSES_COLOR));

    // Temples run back from the outer rims
    for (hinge, dir) in [(right - u * half_w, -1.0), (left + u * half_w, 1.0)] {
        let tip = hinge + w * (ipd * 1.5) + u * (dir * ipd * 0.1);
        segs.extend(segment(&mvp, intr, hinge, tip, GLASSES_COLOR));
    }
    segs
}

/// Per-landmark motion since the previous detection, scaled by `gain`.
pub fn velocity_vectors(previous: &Landmarks, current: &Landmarks, gain: f32) -> Vec<Segment> {
    if previous.frame_sequence == current.frame_sequence || previous.len() != current.len() {
        return Vec::new();
    }
    previous
        .points_2d
        .iter()
        .zip(&current.points_2d)
        .map(|(p, c)| Segment {
            a: *c,
            b: c + (c - p) * gain,
            color: VELOCITY_COLOR,
        })
        .collect()
}

/// Remembers the detection before the current one.
#[derive(Debug, Default)]
pub struct LandmarkHistory {
    current: Option<Arc<Landmarks>>,
    previous: Option<Arc<Landmarks>>,
}

impl LandmarkHistory {
    pub fn observe(&mut self, latest: Option<&Arc<Landmarks>>) {
        let Some(latest) = latest else {
            return;
        };
        let is_new = self
            .current
            .as_ref()
            .map_or(true, |c| c.frame_sequence != latest.frame_sequence);
        if is_new {
            self.previous = self.current.replace(Arc::clone(latest));
        }
    }

    pub fn previous(&self) -> Option<&Landmarks> {
        self.previous.as_deref()
    }
}

/// Assemble the overlay for one tick.
pub fn build_overlay(
    snapshot: &RenderSnapshot,
    history: &mut LandmarkHistory,
    intrinsics: &Intrinsics,
    opts: &OverlayOptions,
) -> Overlay {
    history.observe(snapshot.landmarks.as_ref());
    let mut overlay = Overlay::default();

    if let Some(ext) = snapshot.extrinsics.as_ref() {
        let mvp = model_view_projection(intrinsics, &ext.matrix, opts.near_m, opts.far_m);
        overlay.segments.extend(axes_gizmo(&mvp, intrinsics, opts.axis_length_m));
    }

    if let (true, Some(fit)) = (opts.debug, snapshot.face_fit.as_ref()) {
        overlay.points.extend(fit.vertices.iter().filter_map(|v| {
            let p = intrinsics.project(&Point3::new(f64::from(v.x), f64::from(v.y), f64::from(v.z)))?;
            Some(Point2::new(p.x as f32, p.y as f32))
        }));
    }

    let Some(landmarks) = snapshot.landmarks.as_ref() else {
        return overlay;
    };
    overlay
        .segments
        .extend(glasses_wireframe(landmarks, intrinsics, opts.near_m, opts.far_m));

    if opts.debug {
        overlay.points.extend_from_slice(&landmarks.points_2d);
        if let Some(prev) = history.previous() {
            overlay
                .segments
                .extend(velocity_vectors(prev, landmarks, opts.velocity_gain));
        }
    }
    overlay
}

/// Mirror an x coordinate across the image.
pub fn mirror_x(x: f32, width: u32) -> f32 {
    width as f32 - x
}
