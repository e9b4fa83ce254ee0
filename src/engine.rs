use anyhow::Context;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::detect::{DetectedFace, FaceDetector, FacePolicy};
use crate::error::{EngineError, InvalidEmbedding, StorageError};
use crate::index::IdentityIndex;
use crate::labels::{Label, LabelStore};
use crate::normalize::{normalize, UnitEmbedding};
use crate::storage::SnapshotFile;

/// Result of a recognition request.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    /// The detector found no face; the gallery was not consulted.
    NoFaceDetected,
    InvalidEmbedding(InvalidEmbedding),
    /// No stored identity beat the threshold. `best` is the top similarity
    /// seen, if the gallery was non-empty.
    Unknown { best: Option<f32> },
    Match {
        label: Label,
        position: usize,
        similarity: f32,
    },
}

/// Result of an enrollment request.
#[derive(Debug)]
pub enum Enrollment {
    Enrolled { position: usize },
    InvalidLabel,
    NoFaceDetected,
    InvalidEmbedding(InvalidEmbedding),
    /// The identity is live in memory at `position` but the snapshot write
    /// failed. [`MatchingEngine::persist`] retries it.
    PersistenceFailed {
        position: usize,
        error: StorageError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub position: usize,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub position: usize,
    pub label: Label,
    pub similarity: f32,
}

/// Index and labels, always mutated together.
struct Gallery {
    index: IdentityIndex,
    labels: LabelStore,
}

impl Gallery {
    fn check_aligned(&self) -> Result<(), EngineError> {
        let (vectors, labels) = (self.index.size(), self.labels.size());
        if vectors != labels {
            error!("gallery out of alignment: {vectors} embeddings, {labels} labels");
            return Err(EngineError::Misaligned { vectors, labels });
        }
        Ok(())
    }
}

/// Owns the gallery for the life of the process.
///
/// Recognitions share a read lock and run in parallel. Enrollments queue on
/// the enrollment lane, which is held across insert, append and snapshot
/// write; the insert and append themselves happen under one write lock so a
/// reader never sees one without the other.
pub struct MatchingEngine {
    gallery: RwLock<Gallery>,
    enroll_lane: Mutex<()>,
    store: SnapshotFile,
    threshold: f32,
    policy: FacePolicy,
}

impl MatchingEngine {
    /// Load the snapshot named by `cfg` and build the engine around it.
    pub fn open(cfg: &Config) -> Result<Self, EngineError> {
        cfg.validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let store = SnapshotFile::new(&cfg.snapshot);
        let (index, labels) = store.load(cfg.dimension)?;
        let gallery = Gallery { index, labels };
        gallery.check_aligned()?;

        info!(
            "matching engine ready: {} identities, dimension {}, threshold {:.3}",
            gallery.labels.size(),
            cfg.dimension,
            cfg.threshold
        );
        Ok(Self {
            gallery: RwLock::new(gallery),
            enroll_lane: Mutex::new(()),
            store,
            threshold: cfg.threshold,
            policy: cfg.face_policy,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn dimension(&self) -> usize {
        self.gallery.read().index.dimension()
    }

    pub fn len(&self) -> usize {
        self.gallery.read().labels.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> &SnapshotFile {
        &self.store
    }

    /// Identify `raw`, or report no face when the detector produced nothing.
    pub fn recognize(&self, raw: Option<&[f32]>) -> Result<Recognition, EngineError> {
        let Some(raw) = raw else {
            return Ok(Recognition::NoFaceDetected);
        };
        let query = match normalize(raw) {
            Ok(q) => q,
            Err(e) => return Ok(Recognition::InvalidEmbedding(e.into())),
        };

        let gallery = self.gallery.read();
        gallery.check_aligned()?;
        let hits = match gallery.index.search(&query, 1) {
            Ok(hits) => hits,
            Err(e) => return Ok(Recognition::InvalidEmbedding(e.into())),
        };

        let Some(top) = hits.first() else {
            debug!("gallery is empty, nothing to match");
            return Ok(Recognition::Unknown { best: None });
        };
        if top.similarity > self.threshold {
            let label = gallery.labels.get(top.position).map_err(|e| {
                error!("search hit without a label: {e}");
                e
            })?;
            Ok(Recognition::Match {
                label: label.clone(),
                position: top.position,
                similarity: top.similarity,
            })
        } else {
            debug!(
                "best similarity {:.4} does not exceed threshold {:.4}",
                top.similarity, self.threshold
            );
            Ok(Recognition::Unknown {
                best: Some(top.similarity),
            })
        }
    }

    /// Add a new embedding under `label`. Every call adds a vector; repeated
    /// labels are not merged.
    pub fn enroll(&self, label: &str, raw: Option<&[f32]>) -> Result<Enrollment, EngineError> {
        let Some(label) = Label::parse(label) else {
            return Ok(Enrollment::InvalidLabel);
        };
        let Some(raw) = raw else {
            return Ok(Enrollment::NoFaceDetected);
        };
        let unit = match normalize(raw) {
            Ok(u) => u,
            Err(e) => return Ok(Enrollment::InvalidEmbedding(e.into())),
        };

        let _lane = self.enroll_lane.lock();
        let position = match self.apply(&unit, label.clone())? {
            Ok(position) => position,
            Err(invalid) => return Ok(Enrollment::InvalidEmbedding(invalid)),
        };
        info!("enrolled {label} at position {position}");

        match self.write_snapshot() {
            Ok(()) => Ok(Enrollment::Enrolled { position }),
            Err(error) => {
                warn!("{label} enrolled in memory but snapshot failed: {error}");
                Ok(Enrollment::PersistenceFailed { position, error })
            }
        }
    }

    // Insert and append in one write-locked step.
    fn apply(
        &self,
        unit: &UnitEmbedding,
        label: Label,
    ) -> Result<Result<usize, InvalidEmbedding>, EngineError> {
        let mut gallery = self.gallery.write();
        gallery.check_aligned()?;
        let position = match gallery.index.insert(unit) {
            Ok(position) => position,
            Err(e) => return Ok(Err(e.into())),
        };
        let label_position = gallery.labels.append(label);
        if label_position != position {
            error!("label landed at {label_position}, embedding at {position}");
            return Err(EngineError::Misaligned {
                vectors: gallery.index.size(),
                labels: gallery.labels.size(),
            });
        }
        Ok(Ok(position))
    }

    fn write_snapshot(&self) -> Result<(), StorageError> {
        let gallery = self.gallery.read();
        self.store.save(&gallery.index, &gallery.labels)
    }

    /// Rewrite the snapshot from the in-memory state, e.g. after
    /// [`Enrollment::PersistenceFailed`].
    pub fn persist(&self) -> Result<(), EngineError> {
        let _lane = self.enroll_lane.lock();
        self.gallery.read().check_aligned()?;
        self.write_snapshot()?;
        info!("snapshot written to {}", self.store.path().display());
        Ok(())
    }

    /// Recognize using the face picked by the configured policy.
    pub fn recognize_faces(&self, faces: &[DetectedFace]) -> Result<Recognition, EngineError> {
        if faces.len() > 1 {
            debug!("{} faces detected, applying {:?}", faces.len(), self.policy);
        }
        self.recognize(self.policy.select(faces).map(|f| f.embedding.as_slice()))
    }

    pub fn enroll_faces(
        &self,
        label: &str,
        faces: &[DetectedFace],
    ) -> Result<Enrollment, EngineError> {
        self.enroll(label, self.policy.select(faces).map(|f| f.embedding.as_slice()))
    }

    /// Run `detector` on `image`, then recognize.
    pub fn recognize_image<D: FaceDetector>(
        &self,
        detector: &mut D,
        image: &D::Image,
    ) -> anyhow::Result<Recognition> {
        let faces = detector.detect(image).context("detecting faces")?;
        Ok(self.recognize_faces(&faces)?)
    }

    /// Run `detector` on `image`, then enroll under `label`.
    pub fn enroll_image<D: FaceDetector>(
        &self,
        label: &str,
        detector: &mut D,
        image: &D::Image,
    ) -> anyhow::Result<Enrollment> {
        let faces = detector.detect(image).context("detecting faces")?;
        Ok(self.enroll_faces(label, &faces)?)
    }

    /// Up to `k` nearest identities regardless of threshold.
    pub fn candidates(&self, raw: &[f32], k: usize) -> Result<Vec<Candidate>, EngineError> {
        let query = normalize(raw).map_err(InvalidEmbedding::from)?;
        let gallery = self.gallery.read();
        gallery.check_aligned()?;
        let hits = gallery
            .index
            .search(&query, k)
            .map_err(InvalidEmbedding::from)?;
        hits.into_iter()
            .map(|hit| {
                Ok::<_, EngineError>(Candidate {
                    position: hit.position,
                    label: gallery.labels.get(hit.position)?.clone(),
                    similarity: hit.similarity,
                })
            })
            .collect()
    }

    pub fn identity(&self, position: usize) -> Result<Label, EngineError> {
        Ok(self.gallery.read().labels.get(position)?.clone())
    }

    /// Every enrolled identity, in position order.
    pub fn records(&self) -> Vec<IdentityRecord> {
        self.gallery
            .read()
            .labels
            .iter()
            .enumerate()
            .map(|(position, label)| IdentityRecord {
                position,
                label: label.clone(),
            })
            .collect()
    }

    /// Case-insensitive position lookup by name.
    pub fn positions_of(&self, name: &str) -> Vec<usize> {
        self.gallery.read().labels.positions_of(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DegenerateEmbedding;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, dimension: usize, threshold: f32) -> MatchingEngine {
        let cfg = Config {
            threshold,
            dimension,
            snapshot: dir.path().join("gallery.bin"),
            face_policy: FacePolicy::FirstDetected,
        };
        MatchingEngine::open(&cfg).unwrap()
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let base = Config {
            threshold: 0.5,
            dimension: 2,
            snapshot: dir.path().join("gallery.bin"),
            face_policy: FacePolicy::FirstDetected,
        };
        let bad = [
            Config {
                threshold: f32::NAN,
                ..base.clone()
            },
            Config {
                threshold: 1.5,
                ..base.clone()
            },
            Config {
                dimension: 0,
                ..base.clone()
            },
        ];
        for cfg in &bad {
            assert!(matches!(
                MatchingEngine::open(cfg),
                Err(EngineError::InvalidConfig(_))
            ));
        }
        assert!(!base.snapshot.exists());
        assert!(MatchingEngine::open(&base).is_ok());
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 3, 0.5);
        assert_eq!(
            engine.recognize(Some(&[1.0, 0.0, 0.0])).unwrap(),
            Recognition::Unknown { best: None }
        );
    }

    #[test]
    fn test_no_face_short_circuits() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 3, 0.5);
        assert_eq!(engine.recognize(None).unwrap(), Recognition::NoFaceDetected);
        assert!(matches!(
            engine.enroll("alice", None).unwrap(),
            Enrollment::NoFaceDetected
        ));
        assert!(engine.recognize_faces(&[]).unwrap() == Recognition::NoFaceDetected);
    }

    #[test]
    fn test_invalid_inputs_are_outcomes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 3, 0.5);

        assert!(matches!(
            engine.enroll("   ", Some(&[1.0, 0.0, 0.0])).unwrap(),
            Enrollment::InvalidLabel
        ));
        assert!(matches!(
            engine.enroll("alice", Some(&[0.0, 0.0, 0.0])).unwrap(),
            Enrollment::InvalidEmbedding(InvalidEmbedding::Degenerate(
                DegenerateEmbedding::ZeroNorm
            ))
        ));
        assert!(matches!(
            engine.enroll("alice", Some(&[1.0, 0.0])).unwrap(),
            Enrollment::InvalidEmbedding(InvalidEmbedding::Dimension(_))
        ));
        assert_eq!(
            engine.recognize(Some(&[f32::NAN, 0.0, 1.0])).unwrap(),
            Recognition::InvalidEmbedding(DegenerateEmbedding::NonFinite.into())
        );
        assert!(engine.is_empty());
        assert!(!engine.snapshot().exists());
    }

    #[test]
    fn test_threshold_is_strict() {
        let dir = TempDir::new().unwrap();
        let strict = engine(&dir, 4, 0.5);
        strict.enroll("alice", Some(&[1.0, 0.0, 0.0, 0.0])).unwrap();

        // Normalizes to itself, and its dot product with e0 is exactly 0.5.
        let sample = [0.5, 0.5, 0.5, 0.5];
        assert_eq!(
            strict.recognize(Some(&sample)).unwrap(),
            Recognition::Unknown { best: Some(0.5) }
        );

        let lenient = engine(&dir, 4, 0.49);
        match lenient.recognize(Some(&sample)).unwrap() {
            Recognition::Match {
                label, similarity, ..
            } => {
                assert_eq!(label.as_str(), "alice");
                assert_eq!(similarity, 0.5);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_labels_returned_as_stored() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 2, 0.5);
        engine.enroll("  Alice Smith ", Some(&[1.0, 0.0])).unwrap();
        match engine.recognize(Some(&[2.0, 0.0])).unwrap() {
            Recognition::Match { label, .. } => assert_eq!(label.as_str(), "Alice Smith"),
            other => panic!("expected a match, got {other:?}"),
        }
        assert_eq!(engine.positions_of("alice smith"), vec![0]);
    }

    #[test]
    fn test_candidates_and_records() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 2, 0.9);
        engine.enroll("east", Some(&[1.0, 0.0])).unwrap();
        engine.enroll("north", Some(&[0.0, 1.0])).unwrap();
        engine.enroll("northeast", Some(&[1.0, 1.0])).unwrap();

        let found = engine.candidates(&[1.0, 0.2], 2).unwrap();
        let labels: Vec<&str> = found.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["east", "northeast"]);

        assert!(matches!(
            engine.candidates(&[0.0, 0.0], 2),
            Err(EngineError::InvalidQuery(_))
        ));

        let records = engine.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].position, 2);
        assert_eq!(records[2].label.as_str(), "northeast");
        assert_eq!(engine.identity(1).unwrap().as_str(), "north");
        assert!(matches!(engine.identity(3), Err(EngineError::OutOfRange(_))));
    }

    #[test]
    fn test_duplicate_labels_add_vectors() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 2, 0.5);
        for _ in 0..3 {
            engine.enroll("alice", Some(&[1.0, 0.0])).unwrap();
        }
        assert_eq!(engine.len(), 3);
        assert_eq!(engine.positions_of("alice"), vec![0, 1, 2]);
    }
}
