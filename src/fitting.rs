//! Face fitting: landmarks in, posed face geometry out.

use std::fs;
use std::path::Path;
use std::time::Instant;

use nalgebra::{Matrix4, Point3};
use tracing::{debug, info};

use crate::geometry::rigid_align;
use crate::landmarks::{Landmarks, NUM_FACE_LANDMARKS};
use crate::{Error, Result};

/// Fewest valid 3D landmarks a rigid fit accepts
pub const MIN_FIT_POINTS: usize = 6;

/// A fitted face: head pose plus the posed model vertices, camera space.
#[derive(Debug, Clone)]
pub struct FaceFit {
    pub frame_sequence: u64,
    /// Model -> camera
    pub pose: Matrix4<f64>,
    pub vertices: Vec<Point3<f32>>,
    /// Root-mean-square residual over the points used, metres
    pub rms_error: f64,
    pub fitted_at: Instant,
}

/// Face-fitting collaborator.
///
/// `Ok(None)` means the landmarks were not good enough to fit; the previous
/// fit stays published.
pub trait FaceFitter: Send {
    fn fit(&mut self, landmarks: &Landmarks) -> Result<Option<FaceFit>>;
}

impl<T: FaceFitter + ?Sized> FaceFitter for Box<T> {
    fn fit(&mut self, landmarks: &Landmarks) -> Result<Option<FaceFit>> {
        (**self).fit(landmarks)
    }
}

/// Aligns a rigid 68-point reference face to the observed 3D landmarks.
pub struct RigidFaceFitter {
    template: Vec<Point3<f64>>,
}

impl RigidFaceFitter {
    pub fn new(template: Vec<Point3<f64>>) -> Result<Self> {
        if template.len() != NUM_FACE_LANDMARKS {
            return Err(Error::InvalidInput(format!(
                "face template needs {NUM_FACE_LANDMARKS} points, got {}",
                template.len()
            )));
        }
        Ok(Self { template })
    }

    /// Load a template of whitespace-separated `x y z` triples, scaled to metres.
    pub fn from_file<P: AsRef<Path>>(path: P, scale: f64) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading face template: {}", path.display());
        let content = fs::read_to_string(path).map_err(|e| Error::model_load(path, e))?;
        let template = parse_template(&content, scale).map_err(|e| Error::model_load(path, e))?;
        Self::new(template)
    }

    pub fn template(&self) -> &[Point3<f64>] {
        &self.template
    }
}

fn parse_template(content: &str, scale: f64) -> std::result::Result<Vec<Point3<f64>>, String> {
    let values = content
        .split_whitespace()
        .map(|tok| tok.parse::<f64>().map_err(|e| format!("bad value {tok:?}: {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if values.len() != NUM_FACE_LANDMARKS * 3 {
        return Err(format!(
            "expected {} values ({NUM_FACE_LANDMARKS} points x 3), got {}",
            NUM_FACE_LANDMARKS * 3,
            values.len()
        ));
    }
    Ok(values
        .chunks_exact(3)
        .map(|v| Point3::new(v[0] * scale, v[1] * scale, v[2] * scale))
        .collect())
}

impl FaceFitter for RigidFaceFitter {
    fn fit(&mut self, landmarks: &Landmarks) -> Result<Option<FaceFit>> {
        let (model, observed): (Vec<_>, Vec<_>) = landmarks
            .valid_points()
            .filter_map(|(i, p)| {
                let m = self.template.get(i)?;
                Some((*m, Point3::new(f64::from(p.x), f64::from(p.y), f64::from(p.z))))
            })
            .unzip();

        if model.len() < MIN_FIT_POINTS {
            debug!(valid = model.len(), "too few 3D landmarks to fit");
            return Ok(None);
        }

        let pose = rigid_align(&model, &observed)?;
        let sq: f64 = model
            .iter()
            .zip(&observed)
            .map(|(m, o)| (pose.transform_point(m) - o).norm_squared())
            .sum();
        let rms_error = (sq / model.len() as f64).sqrt();

        let vertices = self
            .template
            .iter()
            .map(|p| {
                let q = pose.transform_point(p);
                Point3::new(q.x as f32, q.y as f32, q.z as f32)
            })
            .collect();

        Ok(Some(FaceFit {
            frame_sequence: landmarks.frame_sequence,
            pose: pose.to_matrix(),
            vertices,
            rms_error,
            fitted_at: Instant::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pose::rotation_from_ypr;
    use crate::geometry::RigidPose;
    use crate::landmarks::FaceBox;
    use nalgebra::{Point2, Vector3};

    fn template() -> Vec<Point3<f64>> {
        (0..NUM_FACE_LANDMARKS)
            .map(|i| {
                let t = i as f64 / NUM_FACE_LANDMARKS as f64 * std::f64::consts::TAU;
                Point3::new(0.07 * t.cos(), 0.09 * t.sin(), 0.02 * (3.0 * t).sin())
            })
            .collect()
    }

    fn landmarks_from(points_3d: Vec<Option<Point3<f32>>>) -> Landmarks {
        Landmarks {
            frame_sequence: 42,
            face: FaceBox::new(0.0, 0.0, 10.0, 10.0, 1.0),
            points_2d: vec![Point2::new(0.0, 0.0); points_3d.len()],
            points_3d,
            detected_at: Instant::now(),
        }
    }

    #[test]
    fn recovers_head_pose() {
        let truth = RigidPose {
            rotation: rotation_from_ypr(0.1, -0.2, 0.05),
            translation: Vector3::new(0.02, -0.01, 0.7),
        };
        let observed = template()
            .iter()
            .enumerate()
            .map(|(i, p)| {
                // Some holes in the depth map
                (i % 5 != 0).then(|| {
                    let q = truth.transform_point(p);
                    Point3::new(q.x as f32, q.y as f32, q.z as f32)
                })
            })
            .collect();

        let mut fitter = RigidFaceFitter::new(template()).unwrap();
        let fit = fitter.fit(&landmarks_from(observed)).unwrap().unwrap();
        assert_eq!(fit.frame_sequence, 42);
        assert_eq!(fit.vertices.len(), NUM_FACE_LANDMARKS);
        assert!(fit.rms_error < 1e-5);
        assert!((fit.pose[(2, 3)] - 0.7).abs() < 1e-5);
    }

    #[test]
    fn too_few_points_yields_no_fit() {
        let mut observed = vec![None; NUM_FACE_LANDMARKS];
        observed[0] = Some(Point3::new(0.0, 0.0, 1.0));
        let mut fitter = RigidFaceFitter::new(template()).unwrap();
        assert!(fitter.fit(&landmarks_from(observed)).unwrap().is_none());
    }

    #[test]
    fn template_parsing_checks_count() {
        let good: String = template()
            .iter()
            .map(|p| format!("{} {} {}\n", p.x * 1000.0, p.y * 1000.0, p.z * 1000.0))
            .collect();
        let parsed = parse_template(&good, 0.001).unwrap();
        assert_eq!(parsed.len(), NUM_FACE_LANDMARKS);
        assert!((parsed[0].x - 0.07).abs() < 1e-9);

        assert!(parse_template("1 2 3", 1.0).is_err());
        assert!(parse_template("a b c", 1.0).is_err());
        assert!(RigidFaceFitter::new(vec![Point3::origin(); 3]).is_err());
    }

    #[test]
    fn missing_template_file_is_a_load_error() {
        assert!(matches!(
            RigidFaceFitter::from_file("/nonexistent/template.txt", 1.0),
            Err(Error::ModelLoad { .. })
        ));
    }
}
