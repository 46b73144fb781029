//! Cache manifests: lineage + quality metadata keyed by request hash.
//!
//! The manifest never caches the served table itself — only where the
//! partitions live and what the quality/lineage verdict was, so hit and
//! miss paths reproduce identical results.

use crate::layout::manifest_path;
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{canonical_json, CanonicalValue};
use marketlab_core::lineage::LineageMeta;
use marketlab_core::quality::QualityReport;
use std::fs;
use std::path::{Path, PathBuf};

/// Write a manifest for a cached request. The hash and storage paths must
/// agree with the lineage they accompany.
pub fn write_manifest(
    root: &Path,
    request_hash: &str,
    lineage: &LineageMeta,
    quality: &QualityReport,
    storage_paths: &[PathBuf],
) -> Result<PathBuf> {
    lineage.validate()?;
    quality.validate()?;
    if request_hash != lineage.request_hash {
        return Err(DataError::storage("request_hash does not match lineage")
            .with("request_hash", request_hash)
            .with("lineage_hash", lineage.request_hash.clone()));
    }
    let normalized = normalize_paths(storage_paths);
    if !lineage.storage_paths.is_empty() && lineage.storage_paths != normalized {
        return Err(DataError::storage("storage_paths do not match lineage")
            .with("request_hash", request_hash));
    }

    let mut payload = lineage.to_payload();
    payload["storage_paths"] = serde_json::json!(normalized);
    payload["quality"] = quality.to_json_value();
    let encoded = canonical_json(&CanonicalValue::from_json(&payload));

    let target = manifest_path(root, request_hash)?;
    let write = || -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, encoded.as_bytes())
    };
    write().map_err(|e| {
        DataError::storage("failed to write manifest")
            .with("path", target.display().to_string())
            .with("request_hash", request_hash)
            .with_cause(e)
    })?;
    Ok(target)
}

pub fn manifest_exists(root: &Path, request_hash: &str) -> Result<bool> {
    Ok(manifest_path(root, request_hash)?.exists())
}

/// Read a manifest back as (lineage, quality).
pub fn read_manifest(root: &Path, request_hash: &str) -> Result<(LineageMeta, QualityReport)> {
    let target = manifest_path(root, request_hash)?;
    if !target.exists() {
        return Err(DataError::storage("manifest missing")
            .with("path", target.display().to_string())
            .with("request_hash", request_hash));
    }
    let raw = fs::read_to_string(&target).map_err(|e| {
        DataError::storage("failed to read manifest")
            .with("path", target.display().to_string())
            .with("request_hash", request_hash)
            .with_cause(e)
    })?;
    let payload: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        DataError::storage("failed to read manifest")
            .with("path", target.display().to_string())
            .with("request_hash", request_hash)
            .with_cause(e)
    })?;
    let lineage = LineageMeta::from_payload(&payload)?;
    let quality: QualityReport = payload
        .get("quality")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| {
            DataError::storage("manifest quality payload invalid")
                .with("request_hash", request_hash)
                .with_cause(e)
        })?
        .unwrap_or_default();
    Ok((lineage, quality))
}

fn normalize_paths(paths: &[PathBuf]) -> Vec<String> {
    let mut normalized: Vec<String> = paths
        .iter()
        .map(|path| path.display().to_string().replace('\\', "/"))
        .collect();
    normalized.sort();
    normalized
}
