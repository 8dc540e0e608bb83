//! Face detection + embedding capability consumed by the pipeline.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// One face found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub embedding: Embedding,
    pub bbox: BoundingBox,
}

/// Finds every face in a packed RGB frame and embeds each of them.
///
/// Returning an empty list is not an error.
pub trait FaceEmbedder: Send {
    fn detect_and_embed(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, EmbedError>;
}

/// SCRFD + ArcFace embedder backed by ONNX Runtime.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    /// Faces smaller than this (in pixels, shorter side) are ignored.
    min_face_size: f32,
}

impl OnnxEmbedder {
    pub fn load(
        detector_path: &str,
        recognizer_path: &str,
        min_detection_confidence: f32,
        min_face_size: f32,
    ) -> Result<Self, EmbedError> {
        let detector = FaceDetector::load(detector_path, min_detection_confidence)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
            min_face_size,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect_and_embed(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, EmbedError> {
        check_frame(rgb, width, height)?;

        let boxes = self.detector.detect(rgb, width, height)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            if bbox.width.min(bbox.height) < self.min_face_size {
                tracing::trace!(?bbox, "face below minimum size");
                continue;
            }
            let embedding = self.recognizer.extract(rgb, width, height, &bbox)?;
            faces.push(DetectedFace { embedding, bbox });
        }
        Ok(faces)
    }
}

/// Reject buffers whose length does not match a packed RGB frame.
pub fn check_frame(rgb: &[u8], width: u32, height: u32) -> Result<(), EmbedError> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(EmbedError::MalformedFrame(format!(
            "{width}x{height} RGB needs {expected} bytes, got {}",
            rgb.len()
        )));
    }
    Ok(())
}
