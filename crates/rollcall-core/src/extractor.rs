//! The face extraction capability: image in, boxed embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One face found in an image.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Embedding,
}

/// Anything that can find faces and embed them.
///
/// The production implementation is [`OnnxExtractor`]; tests inject
/// doubles that return fixed embeddings.
pub trait FaceExtractor {
    fn detect_faces(&mut self, image: &GrayImage) -> Result<Vec<FaceDetection>, ExtractorError>;
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn detect_faces(&mut self, image: &GrayImage) -> Result<Vec<FaceDetection>, ExtractorError> {
        let detections = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());

        for det in &detections {
            match self.recognizer.extract(image, det) {
                Ok(embedding) => faces.push(FaceDetection {
                    bbox: det.bounding_box(),
                    confidence: det.confidence,
                    embedding,
                }),
                Err(RecognizerError::EmptyFace) => {
                    tracing::debug!(confidence = det.confidence, "skipping detection outside the frame");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}

/// The face with the largest box; the first one wins on equal areas.
pub fn largest_face(faces: &[FaceDetection]) -> Option<&FaceDetection> {
    faces.iter().fold(None, |best: Option<&FaceDetection>, face| match best {
        Some(b) if b.bbox.area() >= face.bbox.area() => Some(b),
        _ => Some(face),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(side: i32, tag: f32) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(0, side, side, 0),
            confidence: 0.9,
            embedding: Embedding::new(vec![tag]),
        }
    }

    #[test]
    fn test_largest_face() {
        let faces = vec![face(10, 1.0), face(30, 2.0), face(20, 3.0)];
        assert_eq!(largest_face(&faces).unwrap().embedding.values, vec![2.0]);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![face(30, 1.0), face(30, 2.0)];
        assert_eq!(largest_face(&faces).unwrap().embedding.values, vec![1.0]);
        assert!(largest_face(&[]).is_none());
    }
}
