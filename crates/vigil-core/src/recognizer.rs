//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops the detected face with a margin, resizes it to 112x112 and extracts
//! an L2-normalised 512-dimensional embedding (w600k_r50 model).

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Extra context around the detector box, as a fraction of the box size.
const CROP_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face box lies outside the {width}x{height} frame")]
    FaceOutOfFrame { width: u32, height: u32 },
    #[error("frame buffer does not match {width}x{height} RGB")]
    BadFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Extract the embedding of one detected face in a packed RGB frame.
    pub fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let frame = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(width, height, rgb)
            .ok_or(RecognizerError::BadFrame { width, height })?;
        let crop = crop_face(&frame, face)?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Square crop around the face box, expanded by the margin and clamped to the frame.
pub fn crop_face(
    frame: &ImageBuffer<Rgb<u8>, &[u8]>,
    face: &BoundingBox,
) -> Result<RgbImage, RecognizerError> {
    let (width, height) = frame.dimensions();
    let (x, y, w, h) = crop_region(face, width, height)
        .ok_or(RecognizerError::FaceOutOfFrame { width, height })?;
    Ok(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// Pixel region of the face crop, or `None` if nothing of it is inside the frame.
fn crop_region(face: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).floor().max(0.0);
    let y0 = (cy - side / 2.0).floor().max(0.0);
    let x1 = (cx + side / 2.0).ceil().min(width as f32);
    let y1 = (cy + side / 2.0).ceil().min(height as f32);

    if !(x1 > x0 && y1 > y0) {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Resize a face crop to 112x112 and normalise into a NCHW tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = imageops::resize(
        crop,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_region_expands_to_square() {
        let (x, y, w, h) = crop_region(&face(100.0, 100.0, 40.0, 60.0), 640, 480).unwrap();
        assert_eq!(w, h);
        assert!(w >= 78);
        assert!(x < 100 && y < 100);
    }

    #[test]
    fn test_crop_region_clamped_to_frame() {
        let (x, y, w, h) = crop_region(&face(-10.0, -10.0, 50.0, 50.0), 64, 64).unwrap();
        assert_eq!((x, y), (0, 0));
        assert!(w <= 64 && h <= 64);
    }

    #[test]
    fn test_crop_region_outside_frame() {
        assert!(crop_region(&face(500.0, 500.0, 20.0, 20.0), 100, 100).is_none());
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let crop = RgbImage::from_pixel(50, 50, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 10, 10]] - 1.0).abs() < 0.01);
        assert!((tensor[[0, 1, 10, 10]] + 1.0).abs() < 0.01);
        assert!(tensor[[0, 2, 10, 10]].abs() < 0.01);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_crop_face_size() {
        let data = vec![7u8; 64 * 64 * 3];
        let frame = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(64, 64, &data[..]).unwrap();
        let crop = crop_face(&frame, &face(16.0, 16.0, 20.0, 20.0)).unwrap();
        assert_eq!(crop.width(), crop.height());
        assert!(crop.pixels().all(|p| p.0 == [7, 7, 7]));
    }
}
