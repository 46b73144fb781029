//! Write-once ingest-run metadata files.

use crate::layout::ingest_run_metadata_path;
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{canonical_json, CanonicalValue};
use marketlab_core::run::IngestRunMeta;
use std::fs;
use std::path::{Path, PathBuf};

/// Persist run metadata; a second write for the same run id fails.
pub fn write_ingest_run_meta(raw_root: &Path, meta: &IngestRunMeta) -> Result<PathBuf> {
    meta.validate()?;
    let target_path = ingest_run_metadata_path(raw_root, &meta.ingest_run_id)?;
    if target_path.exists() {
        return Err(DataError::storage("ingest run metadata already exists")
            .with("path", target_path.display().to_string())
            .with("ingest_run_id", meta.ingest_run_id.clone()));
    }
    let payload = serde_json::to_value(meta)
        .map_err(|e| DataError::storage("ingest run metadata serialization failed").with_cause(e))?;
    let encoded = canonical_json(&CanonicalValue::from_json(&payload));

    let write = || -> std::io::Result<()> {
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target_path, encoded.as_bytes())
    };
    write().map_err(|e| {
        DataError::storage("failed to write ingest run metadata")
            .with("path", target_path.display().to_string())
            .with("ingest_run_id", meta.ingest_run_id.clone())
            .with_cause(e)
    })?;
    Ok(target_path)
}

pub fn read_ingest_run_meta(raw_root: &Path, ingest_run_id: &str) -> Result<IngestRunMeta> {
    let target_path = ingest_run_metadata_path(raw_root, ingest_run_id)?;
    if !target_path.exists() {
        return Err(DataError::storage("ingest run metadata missing")
            .with("path", target_path.display().to_string())
            .with("ingest_run_id", ingest_run_id));
    }
    let raw = fs::read_to_string(&target_path).map_err(|e| {
        DataError::storage("failed to read ingest run metadata")
            .with("path", target_path.display().to_string())
            .with_cause(e)
    })?;
    let meta: IngestRunMeta = serde_json::from_str(&raw).map_err(|e| {
        DataError::storage("ingest run metadata invalid")
            .with("path", target_path.display().to_string())
            .with("ingest_run_id", ingest_run_id)
            .with_cause(e)
    })?;
    meta.validate()?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_root() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("marketlab_runs_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_meta() -> IngestRunMeta {
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
        IngestRunMeta::new("ing_20240103_060000Z_0001", start, start, "config-fp").unwrap()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let root = temp_root();
        let meta = sample_meta();

        let path = write_ingest_run_meta(&root, &meta).unwrap();
        assert!(path.ends_with("ingest_run.json"));
        let back = read_ingest_run_meta(&root, &meta.ingest_run_id).unwrap();
        assert_eq!(meta, back);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn second_write_for_same_run_fails() {
        let root = temp_root();
        let meta = sample_meta();

        write_ingest_run_meta(&root, &meta).unwrap();
        let again = write_ingest_run_meta(&root, &meta);
        assert!(again.unwrap_err().to_string().contains("already exists"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_meta_is_an_error() {
        let root = temp_root();
        assert!(read_ingest_run_meta(&root, "ing_20240101_000000Z_0001").is_err());
        let _ = fs::remove_dir_all(&root);
    }
}
