use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    #[serde(default)]
    pub confidence: f32,
}

/// Face embedding vector (typically 128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Only the overlapping prefix is compared; callers are expected to
    /// check dimensions first.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// An enrolled person and the reference embeddings taken from their photos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

impl Identity {
    pub fn new(name: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            name: name.into(),
            embeddings,
        }
    }
}

/// One detected face in a frame. Lives for a single pipeline cycle.
#[derive(Debug, Clone)]
pub struct Probe {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// Result of matching one probe against the enrolled identities.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        identity: String,
        /// Smallest distance among the winning identity's candidate references.
        distance: f32,
    },
    Unmatched,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            MatchResult::Unmatched => None,
        }
    }
}
