//! Pinhole camera model: projection, unprojection, lens distortion.

use nalgebra::{Matrix3, Matrix4, Point2, Point3};
use serde::{Deserialize, Serialize};

/// Camera calibration for one physical camera.
///
/// Camera space follows the usual vision convention: x right, y down,
/// z forward, metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Brown-Conrady coefficients: k1, k2, p1, p2, k3
    #[serde(default)]
    pub distortion: [f64; 5],
}

/// Reference resolution of the factory calibration
const CALIBRATED_WIDTH: u32 = 640;
const CALIBRATED_HEIGHT: u32 = 480;

impl Intrinsics {
    pub const fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            distortion: [0.0; 5],
        }
    }

    /// Checkerboard calibration of the mirror's color camera at 640x480.
    pub const fn mirror_camera() -> Self {
        Self::new(
            302.022_431_62,
            301.805_205_04,
            324.738_664_57,
            216.854_378_25,
            CALIBRATED_WIDTH,
            CALIBRATED_HEIGHT,
        )
    }

    /// Rescale to another stream resolution with the same field of view.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        if width == self.width && height == self.height {
            return *self;
        }
        let sx = f64::from(width) / f64::from(self.width);
        let sy = f64::from(height) / f64::from(self.height);
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
            width,
            height,
            distortion: self.distortion,
        }
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Pixel + metric depth to a camera-space point. `None` for depth <= 0.
    ///
    /// `X = (x - cx) * z / fx`, `Y = (y - cy) * z / fy`, `Z = z`.
    pub fn unproject(&self, x: f64, y: f64, depth_m: f64) -> Option<Point3<f64>> {
        if !(depth_m > 0.0) || !depth_m.is_finite() {
            return None;
        }
        Some(Point3::new(
            (x - self.cx) * depth_m / self.fx,
            (y - self.cy) * depth_m / self.fy,
            depth_m,
        ))
    }

    /// Camera-space point to pixel, ideal pinhole. `None` behind the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Apply lens distortion to normalized image coordinates.
    pub fn distort_normalized(&self, xn: f64, yn: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = xn * radial + 2.0 * p1 * xn * yn + p2 * (r2 + 2.0 * xn * xn);
        let yd = yn * radial + p1 * (r2 + 2.0 * yn * yn) + 2.0 * p2 * xn * yn;
        (xd, yd)
    }

    /// Remove lens distortion from a pixel, returning normalized coordinates.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        if self.distortion.iter().all(|&k| k == 0.0) {
            return (xd, yd);
        }

        // Fixed-point iteration, converges for the mild distortion of webcam lenses
        let (mut xn, mut yn) = (xd, yd);
        for _ in 0..20 {
            let (dx, dy) = self.distort_normalized(xn, yn);
            xn += xd - dx;
            yn += yd - dy;
        }
        (xn, yn)
    }

    /// OpenGL-style clip transform for this camera.
    ///
    /// Takes camera-space points (x right, y down, z forward) to NDC with
    /// y up; depth in `[near, far]` maps to `[-1, 1]`. Combined with the
    /// viewport mapping in [`Self::ndc_to_pixel`] this agrees with
    /// [`Self::project`].
    pub fn projection_matrix(&self, near: f64, far: f64) -> Matrix4<f64> {
        let w = f64::from(self.width);
        let h = f64::from(self.height);
        Matrix4::new(
            2.0 * self.fx / w,
            0.0,
            2.0 * self.cx / w - 1.0,
            0.0,
            0.0,
            -2.0 * self.fy / h,
            1.0 - 2.0 * self.cy / h,
            0.0,
            0.0,
            0.0,
            (far + near) / (far - near),
            -2.0 * far * near / (far - near),
            0.0,
            0.0,
            1.0,
            0.0,
        )
    }

    pub fn ndc_to_pixel(&self, x_ndc: f64, y_ndc: f64) -> Point2<f64> {
        Point2::new(
            (x_ndc + 1.0) * 0.5 * f64::from(self.width),
            (1.0 - y_ndc) * 0.5 * f64::from(self.height),
        )
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self::mirror_camera()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn unproject_then_project_round_trips() {
        let intr = Intrinsics::mirror_camera();
        for &(x, y, d) in &[(0.0, 0.0, 0.3), (320.5, 240.25, 1.0), (639.0, 479.0, 4.2)] {
            let p = intr.unproject(x, y, d).unwrap();
            assert_relative_eq!(p.z, d, epsilon = 1e-12);
            let px = intr.project(&p).unwrap();
            assert_relative_eq!(px.x, x, epsilon = 1e-9);
            assert_relative_eq!(px.y, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn zero_or_negative_depth_is_rejected() {
        let intr = Intrinsics::mirror_camera();
        assert!(intr.unproject(10.0, 10.0, 0.0).is_none());
        assert!(intr.unproject(10.0, 10.0, -1.0).is_none());
        assert!(intr.unproject(10.0, 10.0, f64::NAN).is_none());
        assert!(intr.project(&Point3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn unproject_matches_pinhole_formula() {
        let intr = Intrinsics::new(600.0, 600.0, 319.5, 239.5, 640, 480);
        let p = intr.unproject(419.5, 139.5, 2.0).unwrap();
        assert_relative_eq!(p.x, 100.0 * 2.0 / 600.0);
        assert_relative_eq!(p.y, -100.0 * 2.0 / 600.0);
    }

    #[test]
    fn projection_matrix_agrees_with_project() {
        let intr = Intrinsics::mirror_camera();
        let proj = intr.projection_matrix(0.01, 10.0);
        let p = Point3::new(0.12, -0.05, 0.8);
        let clip = proj * Vector4::new(p.x, p.y, p.z, 1.0);
        let px = intr.ndc_to_pixel(clip.x / clip.w, clip.y / clip.w);
        let expected = intr.project(&p).unwrap();
        assert_relative_eq!(px.x, expected.x, epsilon = 1e-9);
        assert_relative_eq!(px.y, expected.y, epsilon = 1e-9);

        let near = proj * Vector4::new(0.0, 0.0, 0.01, 1.0);
        assert_relative_eq!(near.z / near.w, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn undistort_inverts_distort() {
        let mut intr = Intrinsics::mirror_camera();
        intr.distortion = [-0.12, 0.03, 0.001, -0.0005, 0.0];
        let (xn, yn) = (0.21, -0.14);
        let (xd, yd) = intr.distort_normalized(xn, yn);
        let (u, v) = (xd * intr.fx + intr.cx, yd * intr.fy + intr.cy);
        let (ux, uy) = intr.undistort_pixel(u, v);
        assert_relative_eq!(ux, xn, epsilon = 1e-8);
        assert_relative_eq!(uy, yn, epsilon = 1e-8);
    }

    #[test]
    fn scaling_keeps_field_of_view() {
        let intr = Intrinsics::mirror_camera().scaled_to(1280, 960);
        assert_relative_eq!(intr.fx, 2.0 * 302.022_431_62);
        assert_relative_eq!(intr.cy, 2.0 * 216.854_378_25);
        assert_eq!(intr.width, 1280);
    }
}
