use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Boxed error for trait seams whose implementations live in other crates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Face embedding vector, produced only by the detection/encoding
/// capability. Immutable once created; compared only by distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another embedding.
    ///
    /// Panics if the dimensions differ — embeddings from different
    /// encoders must never meet, so a mismatch is a programmer error.
    pub fn distance(&self, other: &Embedding) -> f32 {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "embedding dimension mismatch: {} vs {}",
            self.values.len(),
            other.values.len()
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled face. A user with several enrolled photos owns several
/// entries sharing an identity; each entry matches independently.
#[derive(Debug, Clone)]
pub struct KnownFaceEntry {
    pub identity: i64,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Point-in-time view of all enrolled faces.
///
/// Never mutated after construction; staleness is handled by wholesale
/// replacement in the [`crate::RegistryCache`].
#[derive(Debug)]
pub struct RegistrySnapshot {
    entries: Vec<KnownFaceEntry>,
    loaded_at: Instant,
}

impl RegistrySnapshot {
    pub fn new(entries: Vec<KnownFaceEntry>) -> Self {
        Self {
            entries,
            loaded_at: Instant::now(),
        }
    }

    pub fn entries(&self) -> &[KnownFaceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

/// Axis-aligned face bounding box in pixel coordinates of the frame it
/// was detected in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence, unrelated to match confidence.
    pub confidence: f32,
}

impl FaceBox {
    /// Scale all coordinates by `factor`, e.g. to map a box found on a
    /// downscaled frame back onto the full-resolution frame.
    pub fn scale(&self, factor: f32) -> FaceBox {
        FaceBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }
}

/// One detection result: where the face is and what it encodes to.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// The detection+encoding capability. Implementations must be
/// deterministic for identical pixel input and may return no faces.
pub trait FaceAnalyzer: Send {
    /// Detect faces in a packed RGB24 image and encode each one.
    fn detect_and_encode(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, BoxError>;
}

/// Storage seam for the registry cache: a full load of every enrolled
/// face entry.
pub trait RegistrySource {
    fn load_known_faces(&self) -> Result<Vec<KnownFaceEntry>, BoxError>;
}

impl<T: RegistrySource> RegistrySource for Arc<T> {
    fn load_known_faces(&self) -> Result<Vec<KnownFaceEntry>, BoxError> {
        (**self).load_known_faces()
    }
}
