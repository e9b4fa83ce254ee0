//! Contract with the upstream face detector / embedding model.
//!
//! The model itself lives outside this crate. Anything that can turn an image
//! into zero or more face embeddings implements [`FaceDetector`]; the engine
//! only ever sees the embedding chosen by a [`FacePolicy`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One face reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl DetectedFace {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            score: None,
        }
    }
}

pub trait FaceDetector {
    type Image: ?Sized;

    /// Faces in detector order. An empty result means no face was found.
    fn detect(&mut self, image: &Self::Image) -> Result<Vec<DetectedFace>>;
}

/// Which face to use when a detector reports several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FacePolicy {
    /// Take the first face in detector order, whatever its score.
    #[default]
    FirstDetected,
}

impl FacePolicy {
    pub fn select<'a>(&self, faces: &'a [DetectedFace]) -> Option<&'a DetectedFace> {
        match self {
            FacePolicy::FirstDetected => faces.first(),
        }
    }
}

/// Reads detector output that was saved as JSON, e.g.
/// `[{"embedding": [0.1, ...], "score": 0.93}]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaceFile;

impl FaceDetector for FaceFile {
    type Image = Path;

    fn detect(&mut self, image: &Path) -> Result<Vec<DetectedFace>> {
        let raw = std::fs::read_to_string(image)
            .with_context(|| format!("reading faces from {}", image.display()))?;
        let faces: Vec<DetectedFace> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing faces in {}", image.display()))?;
        log::debug!("{} face(s) in {}", faces.len(), image.display());
        Ok(faces)
    }
}
