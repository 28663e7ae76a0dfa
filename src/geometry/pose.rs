//! Rigid poses: planar marker pose recovery, point-set alignment, Euler logging helper.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Matrix4, Point2, Point3, Rotation3, Vector3};

use super::{homography, Intrinsics};
use crate::{Error, Result};

/// Rotation + translation taking points from a source frame into the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl RigidPose {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }

    /// Homogeneous 4x4 form.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Self {
            rotation: m.fixed_view::<3, 3>(0, 0).into_owned(),
            translation: m.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }
}

/// Closest proper rotation to `m` in the Frobenius sense.
fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(Error::Pose("SVD did not converge".into())),
    };
    let d = (u * v_t).determinant().signum();
    let fix = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
    Ok(u * fix * v_t)
}

/// Pose of a square planar marker from its four image corners.
///
/// Corners are pixel positions ordered top-left, top-right, bottom-right,
/// bottom-left for an upright marker; they correspond to the marker-plane
/// points `(-s/2, -s/2)`, `(s/2, -s/2)`, `(s/2, s/2)`, `(-s/2, s/2)` at
/// `z = 0`. Lens distortion is removed before fitting.
pub fn planar_marker_pose(
    corners: &[Point2<f64>; 4],
    marker_size_m: f64,
    intrinsics: &Intrinsics,
) -> Result<RigidPose> {
    if !(marker_size_m > 0.0) {
        return Err(Error::Pose(format!("invalid marker size {marker_size_m}")));
    }
    let h = marker_size_m / 2.0;
    let object = [
        Point2::new(-h, -h),
        Point2::new(h, -h),
        Point2::new(h, h),
        Point2::new(-h, h),
    ];
    let image: Vec<Point2<f64>> = corners
        .iter()
        .map(|c| {
            let (x, y) = intrinsics.undistort_pixel(c.x, c.y);
            Point2::new(x, y)
        })
        .collect();

    let hom = homography::estimate(&object, &image)?;
    let h1 = hom.column(0).into_owned();
    let h2 = hom.column(1).into_owned();
    let h3 = hom.column(2).into_owned();

    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm < 1e-12 {
        return Err(Error::Pose("degenerate homography".into()));
    }
    let mut lambda = 1.0 / norm;
    // Marker must be in front of the camera
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;

    Ok(RigidPose {
        rotation,
        translation: h3 * lambda,
    })
}

/// Least-squares rigid alignment (Kabsch) of `source` onto `target`.
///
/// Returns the pose `T` minimizing `sum |T(source_i) - target_i|^2`.
pub fn rigid_align(source: &[Point3<f64>], target: &[Point3<f64>]) -> Result<RigidPose> {
    if source.len() != target.len() {
        return Err(Error::Pose("point sets differ in length".into()));
    }
    if source.len() < 3 {
        return Err(Error::Pose(format!(
            "need 3 correspondences for alignment, got {}",
            source.len()
        )));
    }

    let n = source.len() as f64;
    let src_c = source.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let dst_c = target.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;

    let mut cov = Matrix3::zeros();
    for (s, t) in source.iter().zip(target) {
        cov += (s.coords - src_c) * (t.coords - dst_c).transpose();
    }

    let svd = cov.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(Error::Pose("SVD did not converge".into())),
    };
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let rotation = v * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * u.transpose();
    let translation = dst_c - rotation * src_c;

    Ok(RigidPose {
        rotation,
        translation,
    })
}

/// Fold an angle into `[-pi, pi)`.
pub fn wrap_angle(t: f64) -> f64 {
    if t >= 0.0 {
        (t + PI) % (2.0 * PI) - PI
    } else {
        (t - PI) % (-2.0 * PI) + PI
    }
}

/// Yaw, pitch, roll (radians) of a rotation, Z-Y-X convention.
pub fn yaw_pitch_roll(r: &Matrix3<f64>) -> (f64, f64, f64) {
    let yaw = wrap_angle(r[(1, 0)].atan2(r[(0, 0)]));
    let (s, c) = yaw.sin_cos();
    let pitch = wrap_angle((-r[(2, 0)]).atan2(r[(0, 0)] * c + r[(1, 0)] * s));
    let roll = wrap_angle((r[(0, 2)] * s - r[(1, 2)] * c).atan2(-r[(0, 1)] * s + r[(1, 1)] * c));
    (yaw, pitch, roll)
}

/// Rotation from yaw/pitch/roll; inverse of [`yaw_pitch_roll`].
pub fn rotation_from_ypr(yaw: f64, pitch: f64, roll: f64) -> Matrix3<f64> {
    Rotation3::from_euler_angles(roll, pitch, yaw).into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn project_corners(pose: &RigidPose, size: f64, intr: &Intrinsics) -> [Point2<f64>; 4] {
        let h = size / 2.0;
        let obj = [(-h, -h), (h, -h), (h, h), (-h, h)];
        obj.map(|(x, y)| intr.project(&pose.transform_point(&Point3::new(x, y, 0.0))).unwrap())
    }

    #[test]
    fn marker_pose_recovers_ground_truth() {
        let intr = Intrinsics::mirror_camera();
        let truth = RigidPose {
            rotation: rotation_from_ypr(0.2, -0.15, 0.1),
            translation: Vector3::new(0.05, -0.02, 0.6),
        };
        let corners = project_corners(&truth, 0.1, &intr);

        let pose = planar_marker_pose(&corners, 0.1, &intr).unwrap();
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-6);
    }

    #[test]
    fn fronto_parallel_marker_has_identity_rotation() {
        let intr = Intrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let truth = RigidPose {
            rotation: Matrix3::identity(),
            translation: Vector3::new(0.0, 0.0, 1.0),
        };
        let corners = project_corners(&truth, 0.2, &intr);
        assert_relative_eq!(corners[0].x, 270.0, epsilon = 1e-9);

        let pose = planar_marker_pose(&corners, 0.2, &intr).unwrap();
        assert_relative_eq!(pose.rotation, Matrix3::identity(), epsilon = 1e-9);
        assert_relative_eq!(pose.translation.z, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn marker_size_must_be_positive() {
        let intr = Intrinsics::mirror_camera();
        let c = [Point2::new(0.0, 0.0); 4];
        assert!(planar_marker_pose(&c, 0.0, &intr).is_err());
    }

    #[test]
    fn kabsch_recovers_rigid_motion() {
        let truth = RigidPose {
            rotation: rotation_from_ypr(-0.4, 0.3, 0.05),
            translation: Vector3::new(0.1, 0.2, 0.9),
        };
        let src = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.05, 0.0, 0.01),
            Point3::new(0.0, 0.07, -0.02),
            Point3::new(-0.03, 0.02, 0.04),
        ];
        let dst: Vec<_> = src.iter().map(|p| truth.transform_point(p)).collect();

        let pose = rigid_align(&src, &dst).unwrap();
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-9);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-9);
        assert_relative_eq!(pose.rotation.determinant(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn euler_angles_round_trip() {
        let (yaw, pitch, roll) = (0.7, -0.3, 1.1);
        let r = rotation_from_ypr(yaw, pitch, roll);
        let (y, p, ro) = yaw_pitch_roll(&r);
        assert_relative_eq!(y, yaw, epsilon = 1e-12);
        assert_relative_eq!(p, pitch, epsilon = 1e-12);
        assert_relative_eq!(ro, roll, epsilon = 1e-12);
    }

    #[test]
    fn wrap_angle_folds_into_range() {
        assert_relative_eq!(wrap_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(0.5), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn matrix_round_trip() {
        let pose = RigidPose {
            rotation: rotation_from_ypr(0.1, 0.2, 0.3),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let back = RigidPose::from_matrix(&pose.to_matrix());
        assert_relative_eq!(back.rotation, pose.rotation);
        assert_relative_eq!(back.translation, pose.translation);
    }
}
