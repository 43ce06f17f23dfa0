//! Face embedding extraction via ONNX Runtime.
//!
//! Runs a MobileFaceNet-style model on 112x112 crops and returns
//! L2-normalized 128-dimensional embeddings.

use crate::imageops::resize_region;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{Embedding, FaceBox};
use std::path::Path;
use thiserror::Error;

const ENCODER_INPUT_SIZE: usize = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5;
/// Extra context around the detection box, as a fraction of its longest
/// side. Crop-based models want some forehead and chin in view.
const CROP_MARGIN: f32 = 0.2;

pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0} — place the embedding model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// MobileFaceNet-style face encoder.
pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded face embedding model");

        Ok(Self { session })
    }

    /// Extract an embedding for one detected face in a packed RGB24
    /// image.
    pub fn encode(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Embedding, EncoderError> {
        let crop = crop_face(rgb, width, height, face);
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Square crop around the detection box with margin, resampled to the
/// encoder input size. Regions past the frame edge clamp to edge pixels.
fn crop_face(rgb: &[u8], width: u32, height: u32, face: &FaceBox) -> Vec<u8> {
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let side = face.width.max(face.height) * (1.0 + CROP_MARGIN);
    let half = side / 2.0;

    resize_region(
        rgb,
        width,
        height,
        (cx - half, cy - half, cx + half, cy + half),
        ENCODER_INPUT_SIZE,
        ENCODER_INPUT_SIZE,
    )
}

/// 112x112 RGB crop into a `(x - 127.5) / 127.5` NCHW tensor.
fn preprocess(crop: &[u8]) -> Array4<f32> {
    let size = ENCODER_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let idx = (y * size + x) * 3;
            for ch in 0..3 {
                let pixel = crop.get(idx + ch).copied().unwrap_or(0) as f32;
                tensor[[0, ch, y, x]] = (pixel - ENCODER_MEAN) / ENCODER_STD;
            }
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
