//! Plane-to-image homography via normalized DLT.

use nalgebra::{DMatrix, Matrix3, Point2, SymmetricEigen, Vector3};

use crate::{Error, Result};

/// Map a plane point through `h`. Returns `None` at the line at infinity.
pub fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-15 {
        return None;
    }
    Some(Point2::new(q.x / q.z, q.y / q.z))
}

/// Translate the centroid to the origin and scale the mean distance to sqrt(2).
fn normalizing_transform(pts: &[Point2<f64>]) -> Matrix3<f64> {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Estimate `H` with `dst ~ H * src` from at least four correspondences.
pub fn estimate(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() {
        return Err(Error::Pose(format!(
            "correspondence count mismatch: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    let n = src.len();
    if n < 4 {
        return Err(Error::Pose(format!("need 4 correspondences, got {n}")));
    }

    let t_src = normalizing_transform(src);
    let t_dst = normalizing_transform(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let s = t_src * Vector3::new(s.x, s.y, 1.0);
        let d = t_dst * Vector3::new(d.x, d.y, 1.0);
        let (sx, sy) = (s.x, s.y);
        let (dx, dy) = (d.x, d.y);

        let r = 2 * i;
        a[(r, 3)] = -sx;
        a[(r, 4)] = -sy;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = dy * sx;
        a[(r, 7)] = dy * sy;
        a[(r, 8)] = dy;

        a[(r + 1, 0)] = sx;
        a[(r + 1, 1)] = sy;
        a[(r + 1, 2)] = 1.0;
        a[(r + 1, 6)] = -dx * sx;
        a[(r + 1, 7)] = -dx * sy;
        a[(r + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of the smallest eigenvalue of A^T A
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.abs().total_cmp(&y.1.abs()))
        .ok_or_else(|| Error::Pose("empty eigen decomposition".into()))?;
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::Pose("degenerate image points".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        return Ok(h);
    }
    Ok(h / scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> Vec<Point2<f64>> {
        vec![
            Point2::new(-1.0, -1.0),
            Point2::new(1.0, -1.0),
            Point2::new(1.0, 1.0),
            Point2::new(-1.0, 1.0),
        ]
    }

    #[test]
    fn recovers_known_homography() {
        let truth = Matrix3::new(120.0, 8.0, 320.0, -5.0, 110.0, 240.0, 0.02, -0.01, 1.0);
        let src = square();
        let dst: Vec<_> = src.iter().map(|p| apply(&truth, p).unwrap()).collect();

        let h = estimate(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let q = apply(&h, s).unwrap();
            assert_relative_eq!(q.x, d.x, epsilon = 1e-6);
            assert_relative_eq!(q.y, d.y, epsilon = 1e-6);
        }
        // Off-corner points agree too
        let mid = apply(&h, &Point2::new(0.3, -0.2)).unwrap();
        let expected = apply(&truth, &Point2::new(0.3, -0.2)).unwrap();
        assert_relative_eq!(mid.x, expected.x, epsilon = 1e-6);
        assert_relative_eq!(mid.y, expected.y, epsilon = 1e-6);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let src = square();
        assert!(estimate(&src[..3], &src[..3]).is_err());
        assert!(estimate(&src, &src[..3]).is_err());
    }
}
