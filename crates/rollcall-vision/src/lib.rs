//! rollcall-vision — Face detection and embedding extraction.
//!
//! A two-stage pipeline running on ONNX Runtime: a lightweight
//! single-shot detector locates faces, then a compact encoder turns
//! each crop into a 128-dimensional embedding. The rest of the system
//! only sees this crate through the [`FaceAnalyzer`] trait.

pub mod detector;
pub mod encoder;
mod imageops;

use rollcall_core::{BoxError, DetectedFace, FaceAnalyzer};
use thiserror::Error;

pub use detector::{DetectorError, FaceDetector};
pub use encoder::{EncoderError, FaceEncoder, EMBEDDING_DIM};

/// Standard file name of the detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "version-RFB-320.onnx";
/// Standard file name of the embedding model inside the model directory.
pub const ENCODER_MODEL_FILE: &str = "mobilefacenet.onnx";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// Detection + encoding over one pair of loaded ONNX sessions.
pub struct FacePipeline {
    detector: FaceDetector,
    encoder: FaceEncoder,
}

impl FacePipeline {
    /// Load both models. Fails fast if either file is missing.
    pub fn load(detector_path: &str, encoder_path: &str) -> Result<Self, VisionError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            encoder: FaceEncoder::load(encoder_path)?,
        })
    }

    /// Detect every face in a packed RGB24 image and encode each one,
    /// ordered by descending detector confidence.
    pub fn detect_and_encode(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, VisionError> {
        let boxes = self.detector.detect(rgb, width, height)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.encoder.encode(rgb, width, height, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

impl FaceAnalyzer for FacePipeline {
    fn detect_and_encode(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, BoxError> {
        FacePipeline::detect_and_encode(self, rgb, width, height).map_err(Into::into)
    }
}
