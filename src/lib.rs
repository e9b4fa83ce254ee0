pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod index;
pub mod labels;
pub mod normalize;
pub mod storage;

// Re-export the service surface for convenience
pub use detect::{DetectedFace, FaceDetector, FaceFile, FacePolicy};
pub use engine::{Candidate, Enrollment, IdentityRecord, MatchingEngine, Recognition};
pub use error::{EngineError, InvalidEmbedding};
pub use labels::Label;
pub use normalize::{normalize, UnitEmbedding};
