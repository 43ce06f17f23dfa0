//! Single-shot face detector via ONNX Runtime.
//!
//! Runs an UltraFace-style RFB-320 model: 320x240 RGB input, two
//! outputs — per-anchor [background, face] scores and already-decoded
//! corner boxes in normalized [0, 1] coordinates. Post-processing is a
//! confidence filter plus IoU-based NMS.

use crate::imageops::resize_region;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::FaceBox;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_WIDTH: usize = 320;
const DETECTOR_INPUT_HEIGHT: usize = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_SCORE_THRESHOLD: f32 = 0.7;
const DETECTOR_NMS_IOU: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the detection model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// UltraFace-style face detector.
pub struct FaceDetector {
    session: Session,
    scores_idx: usize,
    boxes_idx: usize,
}

impl FaceDetector {
    /// Load the detection ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection model requires scores and boxes outputs, got {}",
                output_names.len()
            )));
        }

        // Standard exports name the outputs; fall back to positional order.
        let scores_idx = output_names.iter().position(|n| n == "scores").unwrap_or(0);
        let boxes_idx = output_names.iter().position(|n| n == "boxes").unwrap_or(1);

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded face detection model"
        );

        Ok(Self {
            session,
            scores_idx,
            boxes_idx,
        })
    }

    /// Detect faces in a packed RGB24 image, returning pixel-space boxes
    /// sorted by descending confidence.
    pub fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let input = preprocess(rgb, width, height);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[self.scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[self.boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(scores, boxes, width, height, DETECTOR_SCORE_THRESHOLD);
        Ok(nms(candidates, DETECTOR_NMS_IOU))
    }
}

/// Resize to the model input and normalize to `(x - 127) / 128` NCHW.
fn preprocess(rgb: &[u8], width: u32, height: u32) -> Array4<f32> {
    let resized = resize_region(
        rgb,
        width,
        height,
        (0.0, 0.0, width as f32, height as f32),
        DETECTOR_INPUT_WIDTH,
        DETECTOR_INPUT_HEIGHT,
    );

    let mut tensor = Array4::<f32>::zeros((1, 3, DETECTOR_INPUT_HEIGHT, DETECTOR_INPUT_WIDTH));
    for y in 0..DETECTOR_INPUT_HEIGHT {
        for x in 0..DETECTOR_INPUT_WIDTH {
            let idx = (y * DETECTOR_INPUT_WIDTH + x) * 3;
            for ch in 0..3 {
                tensor[[0, ch, y, x]] = (resized[idx + ch] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
            }
        }
    }
    tensor
}

/// Map model outputs to pixel-space boxes, dropping low scores.
///
/// `scores` is `[background, face]` pairs per anchor; `boxes` is
/// normalized `[x1, y1, x2, y2]` per anchor, already decoded by the
/// model graph.
fn decode(scores: &[f32], boxes: &[f32], width: u32, height: u32, threshold: f32) -> Vec<FaceBox> {
    let anchors = scores.len() / 2;
    let mut detections = Vec::new();

    for i in 0..anchors {
        let confidence = scores[i * 2 + 1];
        if confidence <= threshold {
            continue;
        }
        let off = i * 4;
        if off + 3 >= boxes.len() {
            break;
        }

        let x1 = (boxes[off] * width as f32).clamp(0.0, width as f32);
        let y1 = (boxes[off + 1] * height as f32).clamp(0.0, height as f32);
        let x2 = (boxes[off + 2] * width as f32).clamp(0.0, width as f32);
        let y2 = (boxes[off + 3] * height as f32).clamp(0.0, height as f32);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        });
    }

    detections
}

/// Greedy non-maximum suppression, best-first.
fn nms(mut candidates: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<FaceBox> = Vec::new();
    'candidates: for candidate in candidates {
        for winner in &kept {
            if iou(winner, &candidate) > iou_threshold {
                continue 'candidates;
            }
        }
        kept.push(candidate);
    }
    kept
}

/// Intersection-over-Union of two boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
