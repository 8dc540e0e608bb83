use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry identifier of a known person.
pub type PersonId = i64;

/// Bounding box for a detected face, in source frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Normalised distance in [0, 1]: half the Euclidean distance, saturated at 1.
    ///
    /// For unit-length embeddings the half distance already spans [0, 1].
    /// Embeddings of different dimensionality are maximally distant.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 1.0;
        }
        (self.euclidean_distance(other) / 2.0).clamp(0.0, 1.0)
    }

    /// Serialize as little-endian f32 bytes for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse little-endian f32 bytes. Returns `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// A known person as held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    /// One or more reference embeddings; never shared with another person.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
    pub notes: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub visit_count: u64,
}

/// One deduplicated sighting of a known person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub person_id: PersonId,
    pub person_name: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub image_path: PathBuf,
}

/// One deduplicated sighting of an unrecognised face awaiting labelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownSighting {
    pub timestamp: DateTime<Utc>,
    pub image_path: PathBuf,
}

/// An event emitted by the recognition pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SightingEvent {
    Visit(Visit),
    Unknown(UnknownSighting),
}

impl SightingEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Visit(v) => v.timestamp,
            Self::Unknown(u) => u.timestamp,
        }
    }

    pub fn image_path(&self) -> &std::path::Path {
        match self {
            Self::Visit(v) => &v.image_path,
            Self::Unknown(u) => &u.image_path,
        }
    }
}
