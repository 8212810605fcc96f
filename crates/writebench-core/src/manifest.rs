// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Frozen episode manifest.
//!
//! A manifest maps logical episode-set names to their stream file, its
//! BLAKE3 content hash, and the expected record count. The evaluator
//! refuses to run against a set whose bytes or count do not match what
//! was frozen: benchmark numbers are only comparable when everyone ran
//! the same bytes.

use crate::episode::Episode;
use crate::stream::{read_episodes, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One frozen episode set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    /// Stream file path, relative to the manifest file.
    pub path: PathBuf,
    /// Lowercase hex BLAKE3 hash of the stream file's bytes.
    pub blake3: String,
    /// Number of episode records in the stream.
    pub records: u64,
}

/// Errors from manifest loading and verification.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure.
    #[error("[WB_MANIFEST_IO] {path}: {source}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// I/O diagnostic.
        source: std::io::Error,
    },
    /// The manifest file itself failed to parse.
    #[error("[WB_MANIFEST_PARSE] {path}: {source}")]
    Parse {
        /// Manifest file path.
        path: PathBuf,
        /// Parser diagnostic.
        source: serde_json::Error,
    },
    /// The requested set is not in the manifest.
    #[error("[WB_MANIFEST_UNKNOWN_SET] no such episode set: {set}")]
    UnknownSet {
        /// Requested set name.
        set: String,
    },
    /// Stream bytes do not hash to the frozen digest.
    #[error("[WB_MANIFEST_MISMATCH] set {set}: expected {expected}, computed {computed}")]
    HashMismatch {
        /// Set name.
        set: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest computed from the file.
        computed: String,
    },
    /// Stream record count differs from the frozen count.
    #[error("[WB_MANIFEST_COUNT] set {set}: expected {expected} records, loaded {loaded}")]
    RecordCountMismatch {
        /// Set name.
        set: String,
        /// Count recorded in the manifest.
        expected: u64,
        /// Count actually loaded.
        loaded: u64,
    },
    /// The stream failed to load.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// A loaded manifest plus the directory its paths resolve against.
#[derive(Debug, Clone)]
pub struct Manifest {
    base_dir: PathBuf,
    sets: BTreeMap<String, ManifestEntry>,
}

/// Lowercase hex BLAKE3 digest of a file's bytes.
pub fn file_digest(path: &Path) -> Result<String, ManifestError> {
    let bytes = std::fs::read(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
}

impl Manifest {
    /// Loads a manifest file. Entry paths resolve against the file's
    /// parent directory.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = std::fs::read(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let sets: BTreeMap<String, ManifestEntry> = serde_json::from_slice(&bytes)
            .map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Ok(Self { base_dir, sets })
    }

    /// Set names in sorted order.
    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    /// Entry for `set`, if present.
    #[must_use]
    pub fn entry(&self, set: &str) -> Option<&ManifestEntry> {
        self.sets.get(set)
    }

    /// Resolved stream path for an entry.
    #[must_use]
    pub fn resolve(&self, entry: &ManifestEntry) -> PathBuf {
        self.base_dir.join(&entry.path)
    }

    /// Verifies and loads one set: hash check, full parse, count check.
    pub fn load_set(&self, set: &str) -> Result<Vec<Episode>, ManifestError> {
        let entry = self
            .sets
            .get(set)
            .ok_or_else(|| ManifestError::UnknownSet {
                set: set.to_owned(),
            })?;
        let path = self.resolve(entry);
        let computed = file_digest(&path)?;
        if computed != entry.blake3 {
            return Err(ManifestError::HashMismatch {
                set: set.to_owned(),
                expected: entry.blake3.clone(),
                computed,
            });
        }
        let file = std::fs::File::open(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        let episodes = read_episodes(BufReader::new(file), set)?;
        let loaded = episodes.len() as u64;
        if loaded != entry.records {
            return Err(ManifestError::RecordCountMismatch {
                set: set.to_owned(),
                expected: entry.records,
                loaded,
            });
        }
        Ok(episodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn stream_line() -> &'static str {
        "{\"steps\":[{\"t\":0,\"observation\":{\"api\":\"x\",\"v\":1},\"metadata\":{}}],\"labels\":{\"critical_steps\":[0],\"total_drift_events\":1}}\n"
    }

    fn write_manifest(dir: &Path, digest: &str, records: u64) -> PathBuf {
        let manifest_path = dir.join("manifest.json");
        let body = serde_json::json!({
            "tiny": {"path": "tiny.jsonl", "blake3": digest, "records": records}
        });
        std::fs::write(&manifest_path, serde_json::to_vec(&body).unwrap()).unwrap();
        manifest_path
    }

    #[test]
    fn matching_hash_loads() {
        let dir = tempfile::tempdir().unwrap();
        let stream_path = dir.path().join("tiny.jsonl");
        let mut f = std::fs::File::create(&stream_path).unwrap();
        f.write_all(stream_line().as_bytes()).unwrap();
        drop(f);

        let digest = file_digest(&stream_path).unwrap();
        let manifest = Manifest::load(&write_manifest(dir.path(), &digest, 1)).unwrap();
        let episodes = manifest.load_set("tiny").unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].id.as_str(), "tiny:0");
    }

    #[test]
    fn stale_hash_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let stream_path = dir.path().join("tiny.jsonl");
        std::fs::write(&stream_path, stream_line()).unwrap();

        let wrong = "0".repeat(64);
        let manifest = Manifest::load(&write_manifest(dir.path(), &wrong, 1)).unwrap();
        assert!(matches!(
            manifest.load_set("tiny"),
            Err(ManifestError::HashMismatch { .. })
        ));
    }

    #[test]
    fn record_count_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let stream_path = dir.path().join("tiny.jsonl");
        std::fs::write(&stream_path, stream_line()).unwrap();

        let digest = file_digest(&stream_path).unwrap();
        let manifest = Manifest::load(&write_manifest(dir.path(), &digest, 2)).unwrap();
        assert!(matches!(
            manifest.load_set("tiny"),
            Err(ManifestError::RecordCountMismatch {
                expected: 2,
                loaded: 1,
                ..
            })
        ));
    }

    #[test]
    fn unknown_set_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.jsonl"), stream_line()).unwrap();
        let digest = file_digest(&dir.path().join("tiny.jsonl")).unwrap();
        let manifest = Manifest::load(&write_manifest(dir.path(), &digest, 1)).unwrap();
        assert!(matches!(
            manifest.load_set("nope"),
            Err(ManifestError::UnknownSet { .. })
        ));
    }
}
