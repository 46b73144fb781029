//! Write-once raw payloads and staged/atomically-published canonical
//! snapshots.
//!
//! Immutability is enforced at the filesystem level: raw payloads claim
//! their directory with an exclusive create, snapshots are built in a
//! hidden staging directory and become visible through a single atomic
//! rename. A published snapshot never changes; any revision needs a new
//! dataset version.

use crate::layout::{build_canonical_paths, build_raw_paths, CanonicalPaths, RawPaths, METADATA_FILE};
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{canonical_json, CanonicalValue};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// A snapshot under construction: private directory plus content hash.
#[derive(Debug, Clone)]
pub struct StagedSnapshot {
    pub dataset_id: String,
    pub dataset_version: String,
    pub staging_dir: PathBuf,
    pub final_dir: PathBuf,
    pub part_paths: Vec<PathBuf>,
    pub metadata_path: PathBuf,
    pub content_hash: String,
}

/// A published, immutable snapshot.
#[derive(Debug, Clone)]
pub struct PublishedSnapshot {
    pub dataset_id: String,
    pub dataset_version: String,
    pub version_dir: PathBuf,
    pub part_paths: Vec<PathBuf>,
    pub metadata_path: PathBuf,
    pub content_hash: String,
}

/// Write one raw payload plus its metadata, exactly once per
/// (ingest run, request fingerprint).
pub fn store_raw_payload(
    raw_root: &Path,
    ingest_run_id: &str,
    request_fingerprint: &str,
    payload: &[u8],
    metadata: &serde_json::Value,
    ext: &str,
) -> Result<RawPaths> {
    let paths = build_raw_paths(raw_root, ingest_run_id, request_fingerprint, ext)?;
    if paths.base_dir.exists() {
        return Err(DataError::storage("raw payload already exists")
            .with("ingest_run_id", ingest_run_id)
            .with("request_fingerprint", request_fingerprint));
    }
    let write = || -> std::io::Result<()> {
        fs::create_dir_all(paths.base_dir.parent().unwrap_or(raw_root))?;
        // Exclusive create: a concurrent writer for the same key fails here.
        fs::create_dir(&paths.base_dir)?;
        fs::write(&paths.payload_path, payload)?;
        let encoded = canonical_json(&CanonicalValue::from_json(metadata));
        fs::write(&paths.metadata_path, encoded)?;
        Ok(())
    };
    write().map_err(|e| {
        DataError::storage("failed to store raw payload")
            .with("ingest_run_id", ingest_run_id)
            .with("request_fingerprint", request_fingerprint)
            .with_cause(e)
    })?;
    Ok(paths)
}

/// SHA-256 over parts in filename-sorted order, each contributing
/// `filename || 0x00 || bytes`. Part-submission order never matters.
pub fn compute_content_hash(paths: &[PathBuf]) -> Result<String> {
    if paths.is_empty() {
        return Err(DataError::storage("paths must not be empty"));
    }
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort_by_key(|path| path.file_name().map(|n| n.to_os_string()));

    let mut hasher = Sha256::new();
    for path in sorted {
        if !path.exists() {
            return Err(DataError::storage("content hash path missing")
                .with("path", path.display().to_string()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DataError::storage("content hash path has no filename")
                    .with("path", path.display().to_string())
            })?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);

        let mut file = fs::File::open(path).map_err(|e| {
            DataError::storage("failed to read content for hash")
                .with("path", path.display().to_string())
                .with_cause(e)
        })?;
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer).map_err(|e| {
                DataError::storage("failed to read content for hash")
                    .with("path", path.display().to_string())
                    .with_cause(e)
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Build a snapshot in a private staging directory under the dataset dir.
/// Fails up front when the final version directory already exists.
pub fn stage_canonical_snapshot(
    canonical_root: &Path,
    dataset_id: &str,
    dataset_version: &str,
    parts: &[(String, Vec<u8>)],
    metadata: &serde_json::Value,
) -> Result<StagedSnapshot> {
    let paths = build_canonical_paths(canonical_root, dataset_id, dataset_version)?;
    if paths.version_dir.exists() {
        return Err(DataError::storage("canonical snapshot already exists")
            .with("dataset_id", dataset_id)
            .with("dataset_version", dataset_version));
    }
    if parts.is_empty() {
        return Err(DataError::storage("parts must not be empty")
            .with("dataset_id", dataset_id)
            .with("dataset_version", dataset_version));
    }
    fs::create_dir_all(&paths.dataset_dir).map_err(|e| {
        DataError::storage("failed to stage canonical snapshot")
            .with("dataset_id", dataset_id)
            .with("dataset_version", dataset_version)
            .with_cause(e)
    })?;

    let staging_dir = paths.dataset_dir.join(format!(
        ".staging-{dataset_version}-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let staged = write_staging(&staging_dir, &paths, dataset_id, dataset_version, parts, metadata);
    if staged.is_err() {
        // Leave no half-built staging directory behind.
        let _ = fs::remove_dir_all(&staging_dir);
    }
    staged
}

fn write_staging(
    staging_dir: &Path,
    paths: &CanonicalPaths,
    dataset_id: &str,
    dataset_version: &str,
    parts: &[(String, Vec<u8>)],
    metadata: &serde_json::Value,
) -> Result<StagedSnapshot> {
    let storage_err = |message: &str| {
        DataError::storage(message)
            .with("dataset_id", dataset_id)
            .with("dataset_version", dataset_version)
    };

    fs::create_dir(staging_dir).map_err(|e| storage_err("failed to stage canonical snapshot").with_cause(e))?;

    let mut part_paths: Vec<PathBuf> = Vec::with_capacity(parts.len());
    for (name, data) in parts {
        if name.is_empty() {
            return Err(storage_err("part_name must be a non-empty string"));
        }
        let part_path = staging_dir.join(name);
        if part_path.exists() {
            return Err(storage_err("duplicate part file").with("part", name.clone()));
        }
        fs::write(&part_path, data)
            .map_err(|e| storage_err("failed to stage canonical snapshot").with_cause(e))?;
        part_paths.push(part_path);
    }

    let metadata_path = staging_dir.join(METADATA_FILE);
    let encoded = canonical_json(&CanonicalValue::from_json(metadata));
    fs::write(&metadata_path, encoded)
        .map_err(|e| storage_err("failed to stage canonical snapshot").with_cause(e))?;

    let content_hash = compute_content_hash(&part_paths)?;
    Ok(StagedSnapshot {
        dataset_id: dataset_id.to_string(),
        dataset_version: dataset_version.to_string(),
        staging_dir: staging_dir.to_path_buf(),
        final_dir: paths.version_dir.clone(),
        part_paths,
        metadata_path,
        content_hash,
    })
}

/// The single visibility transition: an atomic rename of the staging
/// directory onto the final version directory.
pub fn publish_canonical_snapshot(staged: &StagedSnapshot) -> Result<PublishedSnapshot> {
    if !staged.staging_dir.exists() {
        return Err(DataError::storage("staging directory missing")
            .with("dataset_id", staged.dataset_id.clone())
            .with("dataset_version", staged.dataset_version.clone())
            .with("staging_dir", staged.staging_dir.display().to_string()));
    }
    if staged.final_dir.exists() {
        return Err(DataError::storage("canonical snapshot already exists")
            .with("dataset_id", staged.dataset_id.clone())
            .with("dataset_version", staged.dataset_version.clone()));
    }
    fs::rename(&staged.staging_dir, &staged.final_dir).map_err(|e| {
        DataError::storage("failed to publish canonical snapshot")
            .with("dataset_id", staged.dataset_id.clone())
            .with("dataset_version", staged.dataset_version.clone())
            .with_cause(e)
    })?;
    tracing::info!(
        dataset_id = %staged.dataset_id,
        dataset_version = %staged.dataset_version,
        content_hash = %staged.content_hash,
        "canonical snapshot published"
    );

    let part_paths = staged
        .part_paths
        .iter()
        .map(|path| {
            let name = path.file_name().map(PathBuf::from).unwrap_or_default();
            staged.final_dir.join(name)
        })
        .collect();
    Ok(PublishedSnapshot {
        dataset_id: staged.dataset_id.clone(),
        dataset_version: staged.dataset_version.clone(),
        version_dir: staged.final_dir.clone(),
        part_paths,
        metadata_path: staged.final_dir.join(METADATA_FILE),
        content_hash: staged.content_hash.clone(),
    })
}

/// A published snapshot opened for reading: metadata plus part listing.
#[derive(Debug, Clone)]
pub struct CanonicalDataset {
    pub dataset_id: String,
    pub dataset_version: String,
    pub schema_version: String,
    pub snapshot_path: PathBuf,
    pub metadata: serde_json::Value,
    pub part_paths: Vec<PathBuf>,
}

impl CanonicalDataset {
    pub fn from_snapshot_dir(snapshot_dir: &Path) -> Result<Self> {
        if !snapshot_dir.exists() {
            return Err(DataError::storage("canonical snapshot directory missing")
                .with("path", snapshot_dir.display().to_string()));
        }
        if !snapshot_dir.is_dir() {
            return Err(DataError::storage("canonical snapshot path is not a directory")
                .with("path", snapshot_dir.display().to_string()));
        }
        let metadata_path = snapshot_dir.join(METADATA_FILE);
        let metadata = read_snapshot_metadata(&metadata_path)?;
        let dataset_id = required_str(&metadata, "dataset_id")?;
        let dataset_version = required_str(&metadata, "dataset_version")?;
        let schema_version = required_str(&metadata, "schema_version")?;
        let part_paths = list_part_paths(snapshot_dir)?;
        if part_paths.is_empty() {
            return Err(DataError::storage("canonical snapshot missing parts")
                .with("path", snapshot_dir.display().to_string()));
        }
        Ok(Self {
            dataset_id,
            dataset_version,
            schema_version,
            snapshot_path: snapshot_dir.to_path_buf(),
            metadata,
            part_paths,
        })
    }

    /// Provenance fields for downstream consumers.
    pub fn lineage(&self) -> std::collections::BTreeMap<String, String> {
        let mut lineage = std::collections::BTreeMap::new();
        for key in ["dataset_id", "dataset_version", "ingest_run_id", "schema_version", "asof_ts"] {
            if let Some(serde_json::Value::String(value)) = self.metadata.get(key) {
                if !value.is_empty() {
                    lineage.insert(key.to_string(), value.clone());
                }
            }
        }
        lineage
    }
}

pub(crate) fn read_snapshot_metadata(metadata_path: &Path) -> Result<serde_json::Value> {
    if !metadata_path.exists() {
        return Err(DataError::storage("canonical metadata missing")
            .with("path", metadata_path.display().to_string()));
    }
    let raw = fs::read_to_string(metadata_path).map_err(|e| {
        DataError::storage("failed to read canonical metadata")
            .with("path", metadata_path.display().to_string())
            .with_cause(e)
    })?;
    let payload: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        DataError::storage("failed to read canonical metadata")
            .with("path", metadata_path.display().to_string())
            .with_cause(e)
    })?;
    if !payload.is_object() {
        return Err(DataError::storage("canonical metadata payload invalid")
            .with("path", metadata_path.display().to_string()));
    }
    Ok(payload)
}

pub(crate) fn required_str(payload: &serde_json::Value, field: &str) -> Result<String> {
    match payload.get(field) {
        Some(serde_json::Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        _ => Err(DataError::storage(format!("canonical metadata missing {field}"))
            .with("field", field)),
    }
}

/// Part files of a snapshot directory, filename-sorted.
pub(crate) fn list_part_paths(snapshot_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(snapshot_dir).map_err(|e| {
        DataError::storage("failed to list canonical snapshot")
            .with("path", snapshot_dir.display().to_string())
            .with_cause(e)
    })?;
    let mut parts: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            DataError::storage("failed to list canonical snapshot")
                .with("path", snapshot_dir.display().to_string())
                .with_cause(e)
        })?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("part-") && name.ends_with(".parquet") {
            parts.push(path);
        }
    }
    parts.sort_by_key(|path| path.file_name().map(|n| n.to_os_string()));
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_root() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("marketlab_snap_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_metadata() -> serde_json::Value {
        serde_json::json!({
            "dataset_id": "md.equity.eod.bars",
            "dataset_version": "D1",
            "schema_version": "1.0.0",
        })
    }

    #[test]
    fn raw_payload_is_write_once() {
        let root = temp_root();
        let metadata = serde_json::json!({"retries": 0});

        let paths =
            store_raw_payload(&root, "run-1", "fp-1", b"{\"records\":[]}", &metadata, "json")
                .unwrap();
        assert!(paths.payload_path.exists());
        assert!(paths.metadata_path.exists());

        let second = store_raw_payload(&root, "run-1", "fp-1", b"other", &metadata, "json");
        assert!(second.unwrap_err().to_string().contains("already exists"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn content_hash_ignores_submission_order() {
        let root = temp_root();
        let a = root.join("part-0001.parquet");
        let b = root.join("part-0002.parquet");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"beta").unwrap();

        let forward = compute_content_hash(&[a.clone(), b.clone()]).unwrap();
        let reversed = compute_content_hash(&[b, a]).unwrap();
        assert_eq!(forward, reversed);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn content_hash_detects_renames() {
        let root = temp_root();
        let a = root.join("part-0001.parquet");
        fs::write(&a, b"alpha").unwrap();
        let original = compute_content_hash(&[a.clone()]).unwrap();

        let renamed = root.join("part-0009.parquet");
        fs::rename(&a, &renamed).unwrap();
        let after = compute_content_hash(&[renamed]).unwrap();
        assert_ne!(original, after);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn stage_then_publish_roundtrip() {
        let root = temp_root();
        let parts = vec![("part-0001.parquet".to_string(), b"bytes".to_vec())];

        let staged =
            stage_canonical_snapshot(&root, "md.equity.eod.bars", "D1", &parts, &sample_metadata())
                .unwrap();
        assert!(staged.staging_dir.exists());
        assert!(!staged.final_dir.exists());

        let published = publish_canonical_snapshot(&staged).unwrap();
        assert!(published.version_dir.exists());
        assert!(!staged.staging_dir.exists());
        assert_eq!(published.content_hash, staged.content_hash);

        let opened = CanonicalDataset::from_snapshot_dir(&published.version_dir).unwrap();
        assert_eq!(opened.dataset_id, "md.equity.eod.bars");
        assert_eq!(opened.part_paths.len(), 1);
        let lineage = opened.lineage();
        assert_eq!(lineage.get("dataset_version").map(String::as_str), Some("D1"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn double_publish_fails() {
        let root = temp_root();
        let parts = vec![("part-0001.parquet".to_string(), b"bytes".to_vec())];

        let staged =
            stage_canonical_snapshot(&root, "md.equity.eod.bars", "D1", &parts, &sample_metadata())
                .unwrap();
        publish_canonical_snapshot(&staged).unwrap();

        // Same staged snapshot again: the staging dir is gone.
        let again = publish_canonical_snapshot(&staged);
        assert!(again.is_err());

        // Staging the same version after publish fails up front.
        let restage =
            stage_canonical_snapshot(&root, "md.equity.eod.bars", "D1", &parts, &sample_metadata());
        assert!(restage.unwrap_err().to_string().contains("already exists"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_parts_are_rejected() {
        let root = temp_root();
        let result =
            stage_canonical_snapshot(&root, "md.equity.eod.bars", "D1", &[], &sample_metadata());
        assert!(result.is_err());
        let _ = fs::remove_dir_all(&root);
    }
}
