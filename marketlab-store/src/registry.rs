//! Append-only dataset registry.
//!
//! A newline-delimited JSON log of published dataset versions. An entry is
//! accepted only after the referenced snapshot is independently
//! re-verified on disk — metadata identity, part presence, and a
//! recomputed content hash. The log is never updated or compacted.

use crate::layout::build_canonical_paths;
use crate::snapshot::{compute_content_hash, list_part_paths, read_snapshot_metadata};
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{canonical_json, CanonicalValue};
use marketlab_core::records::require_non_empty as core_require_non_empty;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

/// One immutable row of the registry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistryEntry {
    pub dataset_id: String,
    pub dataset_version: String,
    pub schema_version: String,
    pub created_at_ts: DateTime<Utc>,
    pub ingest_run_id: String,
    pub universe_hash: String,
    pub calendar_version: String,
    pub sessionrules_version: String,
    /// Sorted, duplicate-free provider names.
    pub source_set: Vec<String>,
    pub row_count: u64,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DatasetRegistryEntry {
    pub fn validate(&self) -> Result<()> {
        for (value, name) in [
            (&self.dataset_id, "dataset_id"),
            (&self.dataset_version, "dataset_version"),
            (&self.schema_version, "schema_version"),
            (&self.ingest_run_id, "ingest_run_id"),
            (&self.universe_hash, "universe_hash"),
            (&self.calendar_version, "calendar_version"),
            (&self.sessionrules_version, "sessionrules_version"),
            (&self.content_hash, "content_hash"),
        ] {
            core_require_non_empty(value, name)?;
        }
        if self.source_set.is_empty() {
            return Err(DataError::validation("source_set must not be empty"));
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for item in &self.source_set {
            core_require_non_empty(item, "source_set")?;
            if !seen.insert(item) {
                return Err(DataError::validation("source_set must not contain duplicates")
                    .with("value", item.clone()));
            }
        }
        if !self.source_set.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(DataError::validation("source_set must be sorted"));
        }
        if let Some(notes) = &self.notes {
            core_require_non_empty(notes, "notes")?;
        }
        Ok(())
    }

    fn to_line(&self) -> Result<String> {
        self.validate()?;
        let payload = serde_json::to_value(self)
            .map_err(|e| DataError::storage("registry entry serialization failed").with_cause(e))?;
        Ok(canonical_json(&CanonicalValue::from_json(&payload)))
    }
}

fn load_registry_entries(registry_path: &Path) -> Result<Vec<DatasetRegistryEntry>> {
    if !registry_path.exists() {
        return Ok(vec![]);
    }
    if !registry_path.is_file() {
        return Err(DataError::storage("registry path is not a file")
            .with("path", registry_path.display().to_string()));
    }
    let raw = fs::read_to_string(registry_path).map_err(|e| {
        DataError::storage("failed to read registry")
            .with("path", registry_path.display().to_string())
            .with_cause(e)
    })?;

    let mut entries = Vec::new();
    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: DatasetRegistryEntry = serde_json::from_str(line).map_err(|e| {
            DataError::storage("invalid registry entry")
                .with("path", registry_path.display().to_string())
                .with("line", line_number + 1)
                .with_cause(e)
        })?;
        entry.validate().map_err(|e| {
            DataError::storage("invalid registry entry")
                .with("path", registry_path.display().to_string())
                .with("line", line_number + 1)
                .with_cause(e)
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Linear scan for one (dataset_id, dataset_version). Zero or one match;
/// more than one means the append-only invariant was violated.
pub fn lookup_registry_entry(
    registry_path: &Path,
    dataset_id: &str,
    dataset_version: &str,
) -> Result<Option<DatasetRegistryEntry>> {
    core_require_non_empty(dataset_id, "dataset_id")?;
    core_require_non_empty(dataset_version, "dataset_version")?;
    let mut matches: Vec<DatasetRegistryEntry> = load_registry_entries(registry_path)?
        .into_iter()
        .filter(|entry| {
            entry.dataset_id == dataset_id && entry.dataset_version == dataset_version
        })
        .collect();
    if matches.len() > 1 {
        return Err(DataError::storage("registry contains duplicate entries")
            .with("dataset_id", dataset_id)
            .with("dataset_version", dataset_version));
    }
    Ok(matches.pop())
}

fn ensure_snapshot_matches_entry(
    entry: &DatasetRegistryEntry,
    canonical_root: &Path,
) -> Result<()> {
    let paths = build_canonical_paths(canonical_root, &entry.dataset_id, &entry.dataset_version)?;
    if !paths.version_dir.exists() {
        return Err(DataError::storage("canonical snapshot missing")
            .with("dataset_id", entry.dataset_id.clone())
            .with("dataset_version", entry.dataset_version.clone())
            .with("path", paths.version_dir.display().to_string()));
    }
    if !paths.version_dir.is_dir() {
        return Err(DataError::storage("canonical snapshot path is not a directory")
            .with("path", paths.version_dir.display().to_string()));
    }
    let metadata = read_snapshot_metadata(&paths.metadata_path)?;
    let metadata_dataset_id = metadata.get("dataset_id").and_then(|v| v.as_str());
    if metadata_dataset_id != Some(entry.dataset_id.as_str()) {
        return Err(DataError::storage("canonical metadata dataset_id mismatch")
            .with("expected", entry.dataset_id.clone())
            .with("actual", metadata_dataset_id.unwrap_or_default()));
    }
    let metadata_dataset_version = metadata.get("dataset_version").and_then(|v| v.as_str());
    if metadata_dataset_version != Some(entry.dataset_version.as_str()) {
        return Err(DataError::storage("canonical metadata dataset_version mismatch")
            .with("expected", entry.dataset_version.clone())
            .with("actual", metadata_dataset_version.unwrap_or_default()));
    }
    let part_paths = list_part_paths(&paths.version_dir)?;
    if part_paths.is_empty() {
        return Err(DataError::storage("canonical snapshot missing parts")
            .with("path", paths.version_dir.display().to_string()));
    }
    let content_hash = compute_content_hash(&part_paths)?;
    if content_hash != entry.content_hash {
        return Err(DataError::storage("content hash mismatch")
            .with("dataset_id", entry.dataset_id.clone())
            .with("dataset_version", entry.dataset_version.clone())
            .with("expected", entry.content_hash.clone())
            .with("actual", content_hash));
    }
    Ok(())
}

/// Append one entry, after duplicate lookup and cryptographic verification
/// against the canonical store. One UTF-8 line, keys sorted,
/// newline-terminated.
pub fn append_registry_entry(
    registry_path: &Path,
    entry: &DatasetRegistryEntry,
    canonical_root: &Path,
) -> Result<()> {
    let existing =
        lookup_registry_entry(registry_path, &entry.dataset_id, &entry.dataset_version)?;
    if existing.is_some() {
        return Err(DataError::storage("registry entry already exists")
            .with("dataset_id", entry.dataset_id.clone())
            .with("dataset_version", entry.dataset_version.clone()));
    }
    ensure_snapshot_matches_entry(entry, canonical_root)?;

    let line = entry.to_line()?;
    if let Some(parent) = registry_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            DataError::storage("failed to append registry entry")
                .with("path", registry_path.display().to_string())
                .with_cause(e)
        })?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(registry_path)
        .map_err(|e| {
            DataError::storage("failed to append registry entry")
                .with("path", registry_path.display().to_string())
                .with_cause(e)
        })?;
    writeln!(file, "{line}").map_err(|e| {
        DataError::storage("failed to append registry entry")
            .with("path", registry_path.display().to_string())
            .with_cause(e)
    })?;
    tracing::info!(
        dataset_id = %entry.dataset_id,
        dataset_version = %entry.dataset_version,
        row_count = entry.row_count,
        "registry entry appended"
    );
    Ok(())
}
