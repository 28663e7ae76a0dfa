//! ONNX Runtime face detector + 68-point landmark regressor.

use std::path::Path;

use image::{imageops, RgbImage};
use nalgebra::Point2;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::{FaceBox, LandmarkDetector, NUM_FACE_LANDMARKS};
use crate::capture::ColorImage;
use crate::{DetectionConfig, Error, Result};

/// UltraFace RFB-320 input
const FACE_INPUT_W: u32 = 320;
const FACE_INPUT_H: u32 = 240;
const FACE_MEAN: f32 = 127.0;
const FACE_STD: f32 = 128.0;
const NMS_IOU: f32 = 0.3;

const LANDMARK_INPUT: u32 = 128;

fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    if !path.exists() {
        return Err(Error::model_load(path, "file not found"));
    }
    Session::builder()
        .and_then(|b| b.with_intra_threads(intra_threads.max(1)))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| Error::model_load(path, e))
}

fn first_input_name(session: &Session, path: &Path) -> Result<String> {
    session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| Error::model_load(path, "model has no inputs"))
}

fn run_err(e: ort::Error) -> Error {
    Error::Detection(e.to_string())
}

/// Greedy NMS, highest confidence first
pub fn nms(mut boxes: Vec<FaceBox>, iou_thresh: f32) -> Vec<FaceBox> {
    boxes.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_thresh) {
            kept.push(candidate);
        }
    }
    kept
}

/// Square crop around a face box, shifted down a little so the jaw fits.
pub fn landmark_crop(face: &FaceBox, width: u32, height: u32) -> Option<(u32, u32, u32)> {
    let side = face.width.max(face.height) * 1.1;
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0 + face.height * 0.1;
    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let side = side.min(width as f32 - x0).min(height as f32 - y0);
    if side < 8.0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, side as u32))
}

/// Two ONNX sessions: face boxes, then landmarks inside the chosen box.
pub struct OnnxLandmarkDetector {
    face_session: Session,
    face_input: String,
    landmark_session: Session,
    landmark_input: String,
    /// Boxes below this score are discarded before NMS
    score_threshold: f32,
}

impl OnnxLandmarkDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        info!(
            "Loading face model {} and landmark model {}",
            config.face_model.display(),
            config.landmark_model.display()
        );
        let face_session = build_session(&config.face_model, config.intra_threads)?;
        let face_input = first_input_name(&face_session, &config.face_model)?;
        let landmark_session = build_session(&config.landmark_model, config.intra_threads)?;
        let landmark_input = first_input_name(&landmark_session, &config.landmark_model)?;

        Ok(Self {
            face_session,
            face_input,
            landmark_session,
            landmark_input,
            score_threshold: config.confidence_threshold.min(0.7),
        })
    }

    fn face_tensor(rgb: &RgbImage) -> Result<Tensor<f32>> {
        let resized = imageops::resize(rgb, FACE_INPUT_W, FACE_INPUT_H, imageops::FilterType::Triangle);
        let plane = (FACE_INPUT_W * FACE_INPUT_H) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (i, px) in resized.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = (f32::from(px[c]) - FACE_MEAN) / FACE_STD;
            }
        }
        let shape = [1usize, 3, FACE_INPUT_H as usize, FACE_INPUT_W as usize];
        Tensor::from_array((shape, data.into_boxed_slice())).map_err(run_err)
    }

    fn landmark_tensor(crop: &RgbImage) -> Result<Tensor<f32>> {
        let resized = imageops::resize(crop, LANDMARK_INPUT, LANDMARK_INPUT, imageops::FilterType::Triangle);
        let data: Vec<f32> = resized.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
        let shape = [1usize, LANDMARK_INPUT as usize, LANDMARK_INPUT as usize, 3];
        Tensor::from_array((shape, data.into_boxed_slice())).map_err(run_err)
    }
}

impl LandmarkDetector for OnnxLandmarkDetector {
    fn detect(&mut self, image: &ColorImage) -> Result<Vec<FaceBox>> {
        let rgb = image.to_rgb_image();
        let input = Self::face_tensor(&rgb)?;
        let outputs = self
            .face_session
            .run(ort::inputs![self.face_input.as_str() => input])
            .map_err(run_err)?;

        let (_, scores) = outputs["scores"].try_extract_tensor::<f32>().map_err(run_err)?;
        let (_, boxes) = outputs["boxes"].try_extract_tensor::<f32>().map_err(run_err)?;
        let (w, h) = (image.width() as f32, image.height() as f32);

        let candidates: Vec<FaceBox> = scores
            .chunks_exact(2)
            .zip(boxes.chunks_exact(4))
            .filter(|(s, _)| s[1] >= self.score_threshold)
            .map(|(s, b)| {
                FaceBox::new(b[0] * w, b[1] * h, (b[2] - b[0]) * w, (b[3] - b[1]) * h, s[1])
                    .clamp_to(image.width(), image.height())
            })
            .filter(|f| f.area() > 0.0)
            .collect();

        let faces = nms(candidates, NMS_IOU);
        debug!(faces = faces.len(), "face detection");
        Ok(faces)
    }

    fn predict_landmarks(&mut self, image: &ColorImage, face: &FaceBox) -> Result<Vec<Point2<f32>>> {
        let (x0, y0, side) = landmark_crop(face, image.width(), image.height())
            .ok_or_else(|| Error::Detection("face box too small for landmarks".into()))?;
        let rgb = image.to_rgb_image();
        let crop = imageops::crop_imm(&rgb, x0, y0, side, side).to_image();

        let input = Self::landmark_tensor(&crop)?;
        let outputs = self
            .landmark_session
            .run(ort::inputs![self.landmark_input.as_str() => input])
            .map_err(run_err)?;
        let (_, marks) = outputs[0].try_extract_tensor::<f32>().map_err(run_err)?;

        if marks.len() < NUM_FACE_LANDMARKS * 2 {
            return Err(Error::Detection(format!(
                "landmark model returned {} values, expected {}",
                marks.len(),
                NUM_FACE_LANDMARKS * 2
            )));
        }
        // Some exports emit [0, 1] coordinates, others input pixels
        let normalized = marks[..NUM_FACE_LANDMARKS * 2].iter().all(|v| v.abs() <= 1.5);
        let unit = if normalized { 1.0 } else { LANDMARK_INPUT as f32 };
        let scale = side as f32 / unit;

        Ok(marks[..NUM_FACE_LANDMARKS * 2]
            .chunks_exact(2)
            .map(|m| Point2::new(x0 as f32 + m[0] * scale, y0 as f32 + m[1] * scale))
            .collect())
    }
}
