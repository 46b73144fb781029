//! Deterministic filesystem layout.
//!
//! Every path in the store is derived, never stored:
//! - raw: `<raw_root>/ingest_run_id=<id>/request=<fp>/{payload.<ext>, metadata.json}`
//! - canonical: `<root>/dataset_id=<id>/dataset_version=<v>/{_metadata.json, part-*.parquet}`
//! - market cache: `<root>/market/<provider>/<asset>/<frequency>/part-<year>.parquet`
//! - manifests: `<root>/manifests/<request_hash>.json`

use marketlab_core::error::{DataError, Result};
use marketlab_core::request::AssetId;
use std::path::{Path, PathBuf};

pub const MARKET_DIR: &str = "market";
pub const MANIFESTS_DIR: &str = "manifests";
pub const DEFAULT_FREQUENCY: &str = "1D";
pub const METADATA_FILE: &str = "_metadata.json";
pub const INGEST_RUN_FILE: &str = "ingest_run.json";

/// Filesystem coordinates of one raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPaths {
    pub base_dir: PathBuf,
    pub payload_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Filesystem coordinates of one canonical snapshot version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPaths {
    pub dataset_dir: PathBuf,
    pub version_dir: PathBuf,
    pub metadata_path: PathBuf,
}

fn require_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DataError::storage(format!("{name} must be a non-empty string")));
    }
    Ok(())
}

/// Replace path-hostile characters; reject traversal values outright.
pub fn sanitize_component(value: &str, name: &str) -> Result<String> {
    require_non_empty(value, name)?;
    let sanitized: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();
    if sanitized == "." || sanitized == ".." {
        return Err(DataError::storage(format!("{name} must not be a path traversal value"))
            .with("value", value));
    }
    Ok(sanitized)
}

fn normalize_extension(ext: &str) -> Result<String> {
    let normalized = ext.strip_prefix('.').unwrap_or(ext);
    require_non_empty(normalized, "ext")?;
    Ok(normalized.to_string())
}

pub fn build_raw_paths(
    raw_root: &Path,
    ingest_run_id: &str,
    request_fingerprint: &str,
    ext: &str,
) -> Result<RawPaths> {
    require_non_empty(ingest_run_id, "ingest_run_id")?;
    require_non_empty(request_fingerprint, "request_fingerprint")?;
    let extension = normalize_extension(ext)?;
    let base_dir = raw_root
        .join(format!("ingest_run_id={ingest_run_id}"))
        .join(format!("request={request_fingerprint}"));
    Ok(RawPaths {
        payload_path: base_dir.join(format!("payload.{extension}")),
        metadata_path: base_dir.join("metadata.json"),
        base_dir,
    })
}

pub fn build_canonical_paths(
    canonical_root: &Path,
    dataset_id: &str,
    dataset_version: &str,
) -> Result<CanonicalPaths> {
    require_non_empty(dataset_id, "dataset_id")?;
    require_non_empty(dataset_version, "dataset_version")?;
    let dataset_dir = canonical_root.join(format!("dataset_id={dataset_id}"));
    let version_dir = dataset_dir.join(format!("dataset_version={dataset_version}"));
    Ok(CanonicalPaths {
        metadata_path: version_dir.join(METADATA_FILE),
        dataset_dir,
        version_dir,
    })
}

pub fn ingest_run_dir(raw_root: &Path, ingest_run_id: &str) -> Result<PathBuf> {
    require_non_empty(ingest_run_id, "ingest_run_id")?;
    Ok(raw_root.join(format!("ingest_run_id={ingest_run_id}")))
}

pub fn ingest_run_metadata_path(raw_root: &Path, ingest_run_id: &str) -> Result<PathBuf> {
    Ok(ingest_run_dir(raw_root, ingest_run_id)?.join(INGEST_RUN_FILE))
}

pub fn market_cache_root(root: &Path) -> PathBuf {
    root.join(MARKET_DIR)
}

pub fn asset_dir(
    root: &Path,
    provider: &str,
    asset_id: &AssetId,
    frequency: &str,
) -> Result<PathBuf> {
    let provider = sanitize_component(provider, "provider")?;
    let asset = sanitize_component(asset_id.as_str(), "asset_id")?;
    let frequency = sanitize_component(frequency, "frequency")?;
    Ok(market_cache_root(root).join(provider).join(asset).join(frequency))
}

pub fn asset_cache_path(
    root: &Path,
    provider: &str,
    asset_id: &AssetId,
    year: i32,
    frequency: &str,
) -> Result<PathBuf> {
    if year <= 0 {
        return Err(DataError::storage("year must be positive").with("year", year));
    }
    Ok(asset_dir(root, provider, asset_id, frequency)?.join(format!("part-{year}.parquet")))
}

pub fn manifest_path(root: &Path, request_hash: &str) -> Result<PathBuf> {
    let request = sanitize_component(request_hash, "request_hash")?;
    Ok(root.join(MANIFESTS_DIR).join(format!("{request}.json")))
}

pub fn manifest_lock_path(root: &Path, request_hash: &str) -> Result<PathBuf> {
    let request = sanitize_component(request_hash, "request_hash")?;
    Ok(root.join(MANIFESTS_DIR).join(format!("{request}.lock")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_paths_are_bit_exact() {
        let paths =
            build_raw_paths(Path::new("/data/raw"), "ing_20240101_000000Z_0001", "abc", "json")
                .unwrap();
        assert_eq!(
            paths.payload_path,
            Path::new("/data/raw/ingest_run_id=ing_20240101_000000Z_0001/request=abc/payload.json")
        );
        assert_eq!(
            paths.metadata_path,
            Path::new("/data/raw/ingest_run_id=ing_20240101_000000Z_0001/request=abc/metadata.json")
        );
    }

    #[test]
    fn extension_dot_prefix_is_stripped() {
        let paths = build_raw_paths(Path::new("/r"), "run", "fp", ".csv").unwrap();
        assert!(paths.payload_path.ends_with("payload.csv"));
    }

    #[test]
    fn canonical_paths_are_bit_exact() {
        let paths =
            build_canonical_paths(Path::new("/data/canonical"), "md.equity.eod.bars", "D1")
                .unwrap();
        assert_eq!(
            paths.version_dir,
            Path::new("/data/canonical/dataset_id=md.equity.eod.bars/dataset_version=D1")
        );
        assert!(paths.metadata_path.ends_with("_metadata.json"));
    }

    #[test]
    fn asset_components_are_sanitized() {
        let path = asset_cache_path(
            Path::new("/cache"),
            "stub",
            &AssetId::new("EQ:SPY"),
            2024,
            DEFAULT_FREQUENCY,
        )
        .unwrap();
        assert_eq!(
            path,
            Path::new("/cache/market/stub/EQ_SPY/1D/part-2024.parquet")
        );
    }

    #[test]
    fn traversal_components_are_rejected() {
        assert!(sanitize_component("..", "asset_id").is_err());
        assert!(asset_dir(Path::new("/c"), "p", &AssetId::new(".."), "1D").is_err());
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(build_raw_paths(Path::new("/r"), "", "fp", "json").is_err());
        assert!(build_canonical_paths(Path::new("/c"), "ds", "").is_err());
    }
}
