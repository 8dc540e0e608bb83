//! vigil-core: Face matching and visit deduplication.
//!
//! Matches face embeddings against the known-persons registry and turns a
//! stream of per-frame sightings into one event per visit. Also hosts the
//! SCRFD/ArcFace embedder and the shared configuration.

pub mod config;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod recognizer;
pub mod sampler;
pub mod tracker;
pub mod types;

pub use config::Config;
pub use embedder::{DetectedFace, EmbedError, FaceEmbedder, OnnxEmbedder};
pub use matcher::{EuclideanMatcher, MatchResult, MatchedPerson, Matcher};
pub use sampler::FrameSampler;
pub use tracker::{RecognitionState, TrackerDecision, TrackerPolicy, VisitTracker};
pub use types::{BoundingBox, Embedding, Person, PersonId, SightingEvent, UnknownSighting, Visit};
