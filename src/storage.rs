use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::index::IdentityIndex;
use crate::labels::{Label, LabelStore};
use crate::normalize::UnitEmbedding;

pub const SNAPSHOT_VERSION: u16 = 1;

/// Borrowed view written to disk.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u16,
    dimension: u32,
    embeddings: Vec<&'a [f32]>,
    labels: Vec<&'a Label>,
}

/// Owned form read back. Labels stay plain strings here so a blank one is
/// reported as corruption rather than a decode failure.
#[derive(Deserialize)]
struct Snapshot {
    version: u16,
    dimension: u32,
    embeddings: Vec<Vec<f32>>,
    labels: Vec<String>,
}

/// Single-file snapshot of the identity index and label store.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the snapshot back. A missing file is an empty gallery of the
    /// configured `dimension`.
    pub fn load(&self, dimension: usize) -> Result<(IdentityIndex, LabelStore), StorageError> {
        self.remove_stale_temp();
        if !self.path.exists() {
            info!("no snapshot at {}, starting empty", self.path.display());
            return Ok((IdentityIndex::new(dimension), LabelStore::new()));
        }

        let data = fs::read(&self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: Snapshot =
            postcard::from_bytes(&data).map_err(|source| StorageError::Decode {
                path: self.path.clone(),
                source,
            })?;

        let (index, labels) = self.restore(snapshot, dimension)?;
        info!(
            "loaded {} identities from {}",
            labels.size(),
            self.path.display()
        );
        Ok((index, labels))
    }

    fn restore(
        &self,
        snapshot: Snapshot,
        dimension: usize,
    ) -> Result<(IdentityIndex, LabelStore), StorageError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", snapshot.version)));
        }
        if snapshot.embeddings.len() != snapshot.labels.len() {
            return Err(self.corrupt(format!(
                "{} embeddings but {} labels",
                snapshot.embeddings.len(),
                snapshot.labels.len()
            )));
        }
        let found = snapshot.dimension as usize;
        if found != dimension {
            return Err(StorageError::DimensionMismatch {
                path: self.path.clone(),
                expected: dimension,
                found,
            });
        }

        let mut index = IdentityIndex::new(dimension);
        for (position, row) in snapshot.embeddings.into_iter().enumerate() {
            if row.len() != dimension {
                return Err(self.corrupt(format!(
                    "embedding {position} has width {}, expected {dimension}",
                    row.len()
                )));
            }
            let unit = UnitEmbedding::from_stored(row)
                .ok_or_else(|| self.corrupt(format!("embedding {position} is not unit length")))?;
            index
                .insert(&unit)
                .map_err(|e| self.corrupt(format!("embedding {position}: {e}")))?;
        }

        let labels = snapshot
            .labels
            .into_iter()
            .enumerate()
            .map(|(position, raw)| {
                Label::parse(&raw).ok_or_else(|| self.corrupt(format!("label {position} is blank")))
            })
            .collect::<Result<LabelStore, _>>()?;

        Ok((index, labels))
    }

    /// Replace the snapshot with the given state.
    ///
    /// The new contents go to a sibling temp file which is synced and then
    /// renamed over the old one, so readers only ever find a complete file.
    pub fn save(&self, index: &IdentityIndex, labels: &LabelStore) -> Result<(), StorageError> {
        if index.size() != labels.size() {
            return Err(self.corrupt(format!(
                "refusing to write {} embeddings with {} labels",
                index.size(),
                labels.size()
            )));
        }

        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            dimension: index.dimension() as u32,
            embeddings: index.rows().collect(),
            labels: labels.iter().collect(),
        };
        let data = postcard::to_allocvec(&snapshot).map_err(|source| StorageError::Encode {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io(parent, e))?;
            }
        }

        let tmp = self.temp_path();
        if let Err(e) = write_synced(&tmp, &data) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(self.io(&self.path, e));
        }
        sync_parent(&self.path).map_err(|e| self.io(&self.path, e))?;

        debug!(
            "wrote snapshot of {} identities ({} bytes) to {}",
            labels.size(),
            data.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Sibling the next snapshot is written to before the rename. The name
    /// is fixed: writers are serialized, and a crash leaves at most one.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    // Leftover from a save interrupted before its rename.
    fn remove_stale_temp(&self) {
        let tmp = self.temp_path();
        if !tmp.is_file() {
            return;
        }
        match fs::remove_file(&tmp) {
            Ok(()) => warn!("removed unfinished snapshot {}", tmp.display()),
            Err(e) => warn!("could not remove unfinished snapshot {}: {}", tmp.display(), e),
        }
    }

    fn corrupt(&self, reason: String) -> StorageError {
        StorageError::CorruptSnapshot {
            path: self.path.clone(),
            reason,
        }
    }

    fn io(&self, path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use tempfile::TempDir;

    fn gallery(entries: &[(&str, &[f32])]) -> (IdentityIndex, LabelStore) {
        let dim = entries.first().map(|(_, v)| v.len()).unwrap_or(2);
        let mut index = IdentityIndex::new(dim);
        let mut labels = LabelStore::new();
        for (label, v) in entries {
            index.insert(&normalize(v).unwrap()).unwrap();
            labels.append(Label::parse(label).unwrap());
        }
        (index, labels)
    }

    fn write_raw(path: &Path, version: u16, dimension: u32, embeddings: Vec<Vec<f32>>, labels: Vec<&str>) {
        #[derive(Serialize)]
        struct Raw<'a> {
            version: u16,
            dimension: u32,
            embeddings: Vec<Vec<f32>>,
            labels: Vec<&'a str>,
        }
        let data = postcard::to_allocvec(&Raw {
            version,
            dimension,
            embeddings,
            labels,
        })
        .unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("gallery.bin"));
        let (index, labels) = file.load(8).unwrap();
        assert_eq!(index.size(), 0);
        assert_eq!(index.dimension(), 8);
        assert!(labels.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested/gallery.bin"));
        let (index, labels) = gallery(&[
            ("alice", &[1.0, 0.0, 0.0]),
            ("Bob", &[0.0, 3.0, 0.0]),
            ("alice", &[1.0, 1.0, 0.0]),
        ]);
        file.save(&index, &labels).unwrap();

        let (index2, labels2) = file.load(3).unwrap();
        assert_eq!(index2.size(), 3);
        for i in 0..3 {
            assert_eq!(labels2.get(i).unwrap(), labels.get(i).unwrap());
            assert_eq!(index2.get(i), index.get(i));
        }
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("gallery.bin"));
        let (index, labels) = gallery(&[("alice", &[1.0, 0.0])]);
        file.save(&index, &labels).unwrap();
        file.save(&index, &labels).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("gallery.bin")]);
    }

    #[test]
    fn test_failed_save_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.bin");
        let file = SnapshotFile::new(&path);
        let (index, labels) = gallery(&[("alice", &[1.0, 0.0])]);
        file.save(&index, &labels).unwrap();

        // A directory in the temp file's place makes the next write fail.
        let tmp = file.temp_path();
        fs::create_dir(&tmp).unwrap();
        let (grown, grown_labels) = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        let err = file.save(&grown, &grown_labels).unwrap_err();
        assert!(matches!(err, StorageError::Io { ref path, .. } if *path == tmp), "{err}");

        let (index2, labels2) = file.load(2).unwrap();
        assert_eq!(index2.size(), 1);
        assert_eq!(labels2.get(0).unwrap().as_str(), "alice");
        assert_eq!(index2.get(0), index.get(0));
        assert!(!tmp.is_file());

        fs::remove_dir(&tmp).unwrap();
        file.save(&grown, &grown_labels).unwrap();
        assert_eq!(file.load(2).unwrap().1.size(), 2);
        assert!(!tmp.exists());
    }

    #[test]
    fn test_load_removes_unfinished_temp_file() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("gallery.bin"));
        let (index, labels) = gallery(&[("alice", &[1.0, 0.0])]);
        file.save(&index, &labels).unwrap();

        // A save that died between write and rename.
        let tmp = file.temp_path();
        fs::write(&tmp, b"half a snapshot").unwrap();

        let (index2, labels2) = file.load(2).unwrap();
        assert_eq!(index2.size(), 1);
        assert_eq!(labels2.get(0).unwrap().as_str(), "alice");
        assert!(!tmp.exists());
    }

    #[test]
    fn test_mismatched_lengths_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.bin");
        write_raw(&path, SNAPSHOT_VERSION, 2, vec![vec![1.0, 0.0]], vec!["a", "b"]);
        let err = SnapshotFile::new(&path).load(2).unwrap_err();
        assert!(matches!(err, StorageError::CorruptSnapshot { .. }), "{err}");
    }

    #[test]
    fn test_bad_rows_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.bin");

        write_raw(&path, SNAPSHOT_VERSION, 2, vec![vec![1.0, 0.0, 0.0]], vec!["a"]);
        assert!(matches!(
            SnapshotFile::new(&path).load(2),
            Err(StorageError::CorruptSnapshot { .. })
        ));

        write_raw(&path, SNAPSHOT_VERSION, 2, vec![vec![3.0, 4.0]], vec!["a"]);
        assert!(matches!(
            SnapshotFile::new(&path).load(2),
            Err(StorageError::CorruptSnapshot { .. })
        ));

        write_raw(&path, SNAPSHOT_VERSION, 2, vec![vec![1.0, 0.0]], vec!["  "]);
        assert!(matches!(
            SnapshotFile::new(&path).load(2),
            Err(StorageError::CorruptSnapshot { .. })
        ));

        write_raw(&path, 99, 2, vec![], vec![]);
        assert!(matches!(
            SnapshotFile::new(&path).load(2),
            Err(StorageError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_dimension_must_match_config() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("gallery.bin"));
        let (index, labels) = gallery(&[("alice", &[1.0, 0.0])]);
        file.save(&index, &labels).unwrap();
        assert!(matches!(
            file.load(512),
            Err(StorageError::DimensionMismatch {
                expected: 512,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_file_fails_to_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gallery.bin");
        let file = SnapshotFile::new(&path);
        let (index, labels) = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        file.save(&index, &labels).unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() / 2]).unwrap();
        assert!(matches!(file.load(2), Err(StorageError::Decode { .. })));
    }
}
