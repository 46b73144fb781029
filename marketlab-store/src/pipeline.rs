//! Ingestion pipeline: fetch → store raw → normalize → validate → stage →
//! publish → register → record run metadata.
//!
//! Fetching and payload parsing are external collaborators behind the
//! `ProviderAdapter` and `RecordNormalizer` seams; this module owns the
//! ordering, the consistency gates, and the all-or-nothing failure
//! behavior (nothing reaches the registry unless every prior step held).

use crate::parts::build_canonical_parts;
use crate::registry::{append_registry_entry, DatasetRegistryEntry};
use crate::runs::write_ingest_run_meta;
use crate::layout::RawPaths;
use crate::snapshot::{
    publish_canonical_snapshot, stage_canonical_snapshot, store_raw_payload, PublishedSnapshot,
};
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{fingerprint, format_utc, CanonicalValue};
use marketlab_core::quality::ValidationReport;
use marketlab_core::records::{require_non_empty, CanonicalRecord, Source, SCHEMA_VERSION};
use marketlab_core::run::IngestRunMeta;
use marketlab_core::sessions::{CalendarBaseline, SessionRulesSnapshot};
use marketlab_core::universe::UniverseSnapshot;
use marketlab_core::validate::{
    validate_records, TimeSemanticsContext, ValidationContext, ValidationOptions,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A provider fetch request: dataset plus opaque request parameters.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub dataset_id: String,
    pub params: CanonicalValue,
}

impl FetchRequest {
    pub fn new(dataset_id: impl Into<String>, params: CanonicalValue) -> Result<Self> {
        let request = Self {
            dataset_id: dataset_id.into(),
            params,
        };
        require_non_empty(&request.dataset_id, "dataset_id")?;
        Ok(request)
    }

    /// Request payload as a canonical value, dataset id included.
    pub fn request_payload(&self) -> CanonicalValue {
        let mut entries = BTreeMap::new();
        entries.insert(
            "dataset_id".to_string(),
            CanonicalValue::string(self.dataset_id.clone()),
        );
        entries.insert("params".to_string(), self.params.clone());
        CanonicalValue::Map(entries)
    }

    /// Deterministic identity of this request.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.request_payload())
    }
}

/// What a provider adapter returns for one fetch.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub payload: Vec<u8>,
    pub payload_format: String,
    pub source: Source,
    pub fetched_at_ts: DateTime<Utc>,
    pub request_fingerprint: String,
    pub status_code: Option<u16>,
    pub retries: u32,
    pub pagination: Option<serde_json::Value>,
    pub provider_revision: Option<String>,
}

/// Network/file fetch seam; implementations live outside this crate.
pub trait ProviderAdapter {
    fn fetch(&self, request: &FetchRequest) -> Result<RawResponse>;
}

/// Field-level payload parsing seam: raw bytes → canonical records.
pub trait RecordNormalizer {
    fn normalize(
        &self,
        payload: &[u8],
        context: &NormalizationContext<'_>,
    ) -> Result<Vec<CanonicalRecord>>;
}

/// Everything a normalizer needs to stamp records.
pub struct NormalizationContext<'a> {
    pub dataset_id: &'a str,
    pub schema_version: &'a str,
    pub dataset_version: &'a str,
    pub asof_ts: DateTime<Utc>,
    pub ingest_run_id: &'a str,
    pub source: &'a Source,
    pub universe: &'a UniverseSnapshot,
}

/// Explicit configuration for one ingestion run; no hidden state.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub dataset_id: String,
    pub dataset_version: String,
    pub ingest_run_id: String,
    pub raw_root: PathBuf,
    pub canonical_root: PathBuf,
    pub registry_path: PathBuf,
    pub calendar_version: String,
    pub schema_version: String,
    pub notes: Option<String>,
}

impl IngestionConfig {
    pub fn new(
        dataset_id: impl Into<String>,
        dataset_version: impl Into<String>,
        ingest_run_id: impl Into<String>,
        raw_root: impl Into<PathBuf>,
        canonical_root: impl Into<PathBuf>,
        registry_path: impl Into<PathBuf>,
        calendar_version: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            dataset_id: dataset_id.into(),
            dataset_version: dataset_version.into(),
            ingest_run_id: ingest_run_id.into(),
            raw_root: raw_root.into(),
            canonical_root: canonical_root.into(),
            registry_path: registry_path.into(),
            calendar_version: calendar_version.into(),
            schema_version: SCHEMA_VERSION.into(),
            notes: None,
        };
        require_non_empty(&config.dataset_id, "dataset_id")?;
        require_non_empty(&config.dataset_version, "dataset_version")?;
        require_non_empty(&config.ingest_run_id, "ingest_run_id")?;
        require_non_empty(&config.calendar_version, "calendar_version")?;
        Ok(config)
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Result<Self> {
        let notes = notes.into();
        require_non_empty(&notes, "notes")?;
        self.notes = Some(notes);
        Ok(self)
    }
}

/// Optional timestamp overrides; everything UTC, defaults in a fixed
/// precedence order (asof ← fetched_at, created_at ← generated, the rest
/// ← now).
#[derive(Debug, Clone, Default)]
pub struct IngestionTimestamps {
    pub asof_ts: Option<DateTime<Utc>>,
    pub generated_ts: Option<DateTime<Utc>>,
    pub created_at_ts: Option<DateTime<Utc>>,
    pub started_at_ts: Option<DateTime<Utc>>,
    pub finished_at_ts: Option<DateTime<Utc>>,
}

/// Everything one successful run produced.
#[derive(Debug, Clone)]
pub struct IngestionResult {
    pub raw_paths: RawPaths,
    pub published_snapshot: PublishedSnapshot,
    pub registry_entry: DatasetRegistryEntry,
    pub validation_report: ValidationReport,
    pub ingest_run_meta: IngestRunMeta,
}

/// Run one ingestion for `(dataset_id, dataset_version, ingest_run_id)`.
/// Any failure aborts the run with no registry mutation; staging precedes
/// publish, and registration happens only after a successful publish.
#[allow(clippy::too_many_arguments)]
pub fn run_ingestion(
    request: &FetchRequest,
    adapter: &dyn ProviderAdapter,
    normalizer: &dyn RecordNormalizer,
    config: &IngestionConfig,
    universe: &UniverseSnapshot,
    sessionrules: &SessionRulesSnapshot,
    calendar: &dyn CalendarBaseline,
    timestamps: IngestionTimestamps,
) -> Result<IngestionResult> {
    if request.dataset_id != config.dataset_id {
        return Err(DataError::provider_request(
            "request dataset_id does not match ingestion config",
        )
        .with("request", request.dataset_id.clone())
        .with("config", config.dataset_id.clone()));
    }

    let started_at_ts = timestamps.started_at_ts.unwrap_or_else(Utc::now);
    tracing::info!(
        dataset_id = %config.dataset_id,
        dataset_version = %config.dataset_version,
        ingest_run_id = %config.ingest_run_id,
        "ingestion run started"
    );

    let response = adapter.fetch(request)?;
    // Consistency gate: the provider must echo the request identity.
    let expected_fingerprint = request.fingerprint();
    if response.request_fingerprint != expected_fingerprint {
        return Err(DataError::provider_response("request_fingerprint mismatch")
            .with("expected", expected_fingerprint)
            .with("actual", response.request_fingerprint.clone()));
    }

    let asof_ts = timestamps.asof_ts.unwrap_or(response.fetched_at_ts);
    let generated_ts = timestamps.generated_ts.unwrap_or_else(Utc::now);
    let created_at_ts = timestamps.created_at_ts.unwrap_or(generated_ts);

    let raw_metadata = raw_metadata_payload(request, &response, config, asof_ts);
    let raw_paths = store_raw_payload(
        &config.raw_root,
        &config.ingest_run_id,
        &response.request_fingerprint,
        &response.payload,
        &raw_metadata,
        &response.payload_format,
    )?;

    let normalization_context = NormalizationContext {
        dataset_id: &config.dataset_id,
        schema_version: &config.schema_version,
        dataset_version: &config.dataset_version,
        asof_ts,
        ingest_run_id: &config.ingest_run_id,
        source: &response.source,
        universe,
    };
    let normalized = normalizer.normalize(&response.payload, &normalization_context)?;

    let (validated, report) = validate_records(
        &normalized,
        ValidationOptions {
            context: Some(ValidationContext::new(
                config.dataset_id.clone(),
                config.dataset_version.clone(),
                config.ingest_run_id.clone(),
            )?),
            generated_ts: Some(generated_ts),
            time_context: Some(TimeSemanticsContext::new(universe, sessionrules, calendar)),
            raise_on_hard_error: true,
            ..ValidationOptions::default()
        },
    )?;

    let parts = build_canonical_parts(&validated)?;
    let source_set = vec![response.source.provider.clone()];
    let canonical_metadata = canonical_metadata_payload(
        config,
        created_at_ts,
        asof_ts,
        universe,
        sessionrules,
        &source_set,
        validated.len(),
        &report,
    );

    let staged = stage_canonical_snapshot(
        &config.canonical_root,
        &config.dataset_id,
        &config.dataset_version,
        &parts,
        &canonical_metadata,
    )?;
    let published = publish_canonical_snapshot(&staged)?;

    let entry = DatasetRegistryEntry {
        dataset_id: config.dataset_id.clone(),
        dataset_version: config.dataset_version.clone(),
        schema_version: config.schema_version.clone(),
        created_at_ts,
        ingest_run_id: config.ingest_run_id.clone(),
        universe_hash: universe.universe_hash.clone(),
        calendar_version: config.calendar_version.clone(),
        sessionrules_version: sessionrules.sessionrules_hash.clone(),
        source_set,
        row_count: validated.len() as u64,
        content_hash: published.content_hash.clone(),
        notes: config.notes.clone(),
    };
    append_registry_entry(&config.registry_path, &entry, &config.canonical_root)?;

    let finished_at_ts = timestamps.finished_at_ts.unwrap_or_else(Utc::now);
    let ingest_run_meta = IngestRunMeta::new(
        config.ingest_run_id.clone(),
        started_at_ts,
        finished_at_ts,
        config_fingerprint(config, universe, sessionrules),
    )?;
    write_ingest_run_meta(&config.raw_root, &ingest_run_meta)?;

    tracing::info!(
        dataset_id = %config.dataset_id,
        dataset_version = %config.dataset_version,
        row_count = entry.row_count,
        "ingestion run finished"
    );

    Ok(IngestionResult {
        raw_paths,
        published_snapshot: published,
        registry_entry: entry,
        validation_report: report,
        ingest_run_meta,
    })
}

fn raw_metadata_payload(
    request: &FetchRequest,
    response: &RawResponse,
    config: &IngestionConfig,
    asof_ts: DateTime<Utc>,
) -> serde_json::Value {
    let mut source = serde_json::json!({
        "provider": response.source.provider,
        "endpoint": response.source.endpoint,
    });
    if let Some(provider_dataset) = &response.source.provider_dataset {
        source["provider_dataset"] = serde_json::json!(provider_dataset);
    }

    let request_payload: serde_json::Value = serde_json::from_str(
        &marketlab_core::fingerprint::canonical_json(&request.request_payload()),
    )
    .unwrap_or(serde_json::Value::Null);

    let mut payload = serde_json::json!({
        "dataset_id": request.dataset_id,
        "dataset_version": config.dataset_version,
        "schema_version": config.schema_version,
        "ingest_run_id": config.ingest_run_id,
        "request_payload": request_payload,
        "request_fingerprint": response.request_fingerprint,
        "source": source,
        "fetched_at_ts": format_utc(response.fetched_at_ts),
        "asof_ts": format_utc(asof_ts),
        "payload_format": response.payload_format,
        "retries": response.retries,
    });
    if let Some(status_code) = response.status_code {
        payload["status_code"] = serde_json::json!(status_code);
    }
    if let Some(pagination) = &response.pagination {
        payload["pagination"] = pagination.clone();
    }
    if let Some(provider_revision) = &response.provider_revision {
        payload["provider_revision"] = serde_json::json!(provider_revision);
    }
    payload
}

#[allow(clippy::too_many_arguments)]
fn canonical_metadata_payload(
    config: &IngestionConfig,
    created_at_ts: DateTime<Utc>,
    asof_ts: DateTime<Utc>,
    universe: &UniverseSnapshot,
    sessionrules: &SessionRulesSnapshot,
    source_set: &[String],
    row_count: usize,
    report: &ValidationReport,
) -> serde_json::Value {
    let mut sorted_sources: Vec<&String> = source_set.iter().collect();
    sorted_sources.sort();
    serde_json::json!({
        "dataset_id": config.dataset_id,
        "dataset_version": config.dataset_version,
        "schema_version": config.schema_version,
        "ingest_run_id": config.ingest_run_id,
        "created_at_ts": format_utc(created_at_ts),
        "asof_ts": format_utc(asof_ts),
        "universe_hash": universe.universe_hash,
        "calendar_version": config.calendar_version,
        "sessionrules_version": sessionrules.sessionrules_hash,
        "source_set": sorted_sources,
        "row_count": row_count,
        "validation_report": report.to_payload(),
    })
}

/// Identity of the configuration a run executed under.
fn config_fingerprint(
    config: &IngestionConfig,
    universe: &UniverseSnapshot,
    sessionrules: &SessionRulesSnapshot,
) -> String {
    let mut entries = BTreeMap::new();
    entries.insert(
        "dataset_id".to_string(),
        CanonicalValue::string(config.dataset_id.clone()),
    );
    entries.insert(
        "dataset_version".to_string(),
        CanonicalValue::string(config.dataset_version.clone()),
    );
    entries.insert(
        "schema_version".to_string(),
        CanonicalValue::string(config.schema_version.clone()),
    );
    entries.insert(
        "calendar_version".to_string(),
        CanonicalValue::string(config.calendar_version.clone()),
    );
    entries.insert(
        "universe_hash".to_string(),
        CanonicalValue::string(universe.universe_hash.clone()),
    );
    entries.insert(
        "sessionrules_version".to_string(),
        CanonicalValue::string(sessionrules.sessionrules_hash.clone()),
    );
    if let Some(notes) = &config.notes {
        entries.insert("notes".to_string(), CanonicalValue::string(notes.clone()));
    }
    fingerprint(&CanonicalValue::Map(entries))
}
