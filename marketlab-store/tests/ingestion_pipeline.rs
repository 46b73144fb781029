//! End-to-end ingestion tests with stub provider and normalizer
//! collaborators: publish-once semantics, registry verification, and
//! abort-without-registry-mutation on validation failure.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use marketlab_core::fingerprint::CanonicalValue;
use marketlab_core::records::{
    Bar, CanonicalRecord, RecordCore, TimestampProvenance, EQUITY_EOD_DATASET_ID,
};
use marketlab_core::sessions::{CalendarBaseline, SessionRule, SessionRulesSnapshot};
use marketlab_core::universe::{universe_from_parts, UniverseSnapshot};
use marketlab_store::parts::read_record_part;
use marketlab_store::pipeline::{
    run_ingestion, FetchRequest, IngestionConfig, IngestionTimestamps, NormalizationContext,
    ProviderAdapter, RawResponse, RecordNormalizer,
};
use marketlab_store::registry::lookup_registry_entry;
use marketlab_store::runs::read_ingest_run_meta;
use marketlab_core::records::Source;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root(tag: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = env::temp_dir().join(format!("marketlab_ing_{tag}_{}_{id}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

struct WeekdayCalendar;

impl CalendarBaseline for WeekdayCalendar {
    fn name(&self) -> &str {
        "weekday"
    }
    fn version(&self) -> &str {
        "1"
    }
    fn is_session_day(&self, _mic: &str, session_date: NaiveDate) -> bool {
        use chrono::Datelike;
        session_date.weekday().number_from_monday() <= 5
    }
}

/// Serves a fixed JSON payload and echoes the request fingerprint.
struct StubAdapter {
    payload: serde_json::Value,
    fetched_at: DateTime<Utc>,
    /// When set, returned instead of the true fingerprint.
    forged_fingerprint: Option<String>,
}

impl ProviderAdapter for StubAdapter {
    fn fetch(&self, request: &FetchRequest) -> marketlab_core::Result<RawResponse> {
        Ok(RawResponse {
            payload: serde_json::to_vec(&self.payload).unwrap(),
            payload_format: "json".into(),
            source: Source::new("stub", "eod").unwrap(),
            fetched_at_ts: self.fetched_at,
            request_fingerprint: self
                .forged_fingerprint
                .clone()
                .unwrap_or_else(|| request.fingerprint()),
            status_code: Some(200),
            retries: 0,
            pagination: None,
            provider_revision: None,
        })
    }
}

/// Minimal equity normalizer over `{"records": [...]}` payloads.
struct StubNormalizer;

impl RecordNormalizer for StubNormalizer {
    fn normalize(
        &self,
        payload: &[u8],
        context: &NormalizationContext<'_>,
    ) -> marketlab_core::Result<Vec<CanonicalRecord>> {
        let parsed: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| marketlab_core::DataError::normalization("payload must be JSON").with_cause(e))?;
        let entries = parsed["records"]
            .as_array()
            .ok_or_else(|| marketlab_core::DataError::normalization("payload missing records"))?;
        let lookup = context.universe.equity_lookup();

        let mut records = Vec::new();
        for entry in entries {
            let mic = entry["mic"].as_str().unwrap_or_default().to_string();
            let vendor = entry["vendor_symbol"].as_str().unwrap_or_default().to_string();
            let instrument = lookup.get(&(mic.clone(), vendor.clone())).ok_or_else(|| {
                marketlab_core::DataError::normalization("equity instrument not found")
                    .with("mic", mic)
                    .with("vendor_symbol", vendor)
            })?;
            let ts = DateTime::parse_from_rfc3339(entry["ts"].as_str().unwrap_or_default())
                .map_err(|e| {
                    marketlab_core::DataError::normalization("ts must be ISO-8601").with_cause(e)
                })?
                .with_timezone(&Utc);
            let close = entry["close"].as_f64().ok_or_else(|| {
                marketlab_core::DataError::normalization("close must be numeric")
            })?;
            let trading_date = entry["trading_date"]
                .as_str()
                .map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap());

            let core = RecordCore {
                dataset_id: context.dataset_id.into(),
                schema_version: context.schema_version.into(),
                dataset_version: context.dataset_version.into(),
                instrument_id: instrument.instrument_id.clone(),
                ts,
                asof_ts: context.asof_ts,
                ts_provenance: TimestampProvenance::ProviderEod,
                source: context.source.clone(),
                ingest_run_id: context.ingest_run_id.into(),
                quality_flags: vec![],
                trading_date_local: trading_date,
                timezone_local: instrument.exchange_timezone.clone(),
                currency: instrument.currency.clone(),
                unit: None,
            };
            records.push(CanonicalRecord::bar(core, Bar::from_close(close))?);
        }
        Ok(records)
    }
}

fn fixtures() -> (UniverseSnapshot, SessionRulesSnapshot) {
    let universe = universe_from_parts(
        "2024-01",
        vec![("XNYS", "SPY", "USD", "America/New_York")],
        vec![],
    )
    .unwrap();
    let rules = SessionRulesSnapshot::new(
        "v1",
        vec![SessionRule {
            mic: "XNYS".into(),
            timezone_local: "America/New_York".into(),
            regular_close_local: "16:00".into(),
            regular_open_local: Some("09:30".into()),
            effective_from: None,
            effective_to: None,
            source_note: None,
        }],
    )
    .unwrap();
    (universe, rules)
}

fn single_bar_payload(close: f64) -> serde_json::Value {
    serde_json::json!({
        "records": [{
            "mic": "XNYS",
            "vendor_symbol": "SPY",
            // 16:00 America/New_York on 2024-01-02
            "ts": "2024-01-02T21:00:00+00:00",
            "trading_date": "2024-01-02",
            "close": close,
        }]
    })
}

fn config(root: &Path, version: &str, run_id: &str) -> IngestionConfig {
    IngestionConfig::new(
        EQUITY_EOD_DATASET_ID,
        version,
        run_id,
        root.join("raw"),
        root.join("canonical"),
        root.join("registry.jsonl"),
        "weekday:1",
    )
    .unwrap()
}

fn request() -> FetchRequest {
    FetchRequest::new(
        EQUITY_EOD_DATASET_ID,
        CanonicalValue::Map(
            [
                ("symbols".to_string(), CanonicalValue::string("SPY")),
                ("start".to_string(), CanonicalValue::string("2024-01-02")),
                ("end".to_string(), CanonicalValue::string("2024-01-02")),
            ]
            .into_iter()
            .collect(),
        ),
    )
    .unwrap()
}

fn timestamps() -> IngestionTimestamps {
    let generated = Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap();
    IngestionTimestamps {
        asof_ts: Some(generated),
        generated_ts: Some(generated),
        created_at_ts: Some(generated),
        started_at_ts: Some(generated),
        finished_at_ts: Some(generated),
    }
}

#[test]
fn single_bar_ingestion_publishes_and_registers() {
    let root = temp_root("ok");
    let (universe, rules) = fixtures();
    let adapter = StubAdapter {
        payload: single_bar_payload(192.8),
        fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap(),
        forged_fingerprint: None,
    };
    let config = config(&root, "D1", "ing_20240103_060000Z_0001");

    let result = run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap();

    // Raw payload and metadata landed at the deterministic coordinates.
    assert!(result.raw_paths.payload_path.exists());
    assert!(result.raw_paths.metadata_path.exists());

    // One published part holding exactly the ingested bar.
    assert_eq!(result.published_snapshot.part_paths.len(), 1);
    let part_bytes = fs::read(&result.published_snapshot.part_paths[0]).unwrap();
    let records = read_record_part(&part_bytes).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].as_bar().unwrap().close, 192.8);

    // Registry row cross-checks the snapshot.
    let entry = lookup_registry_entry(&config.registry_path, EQUITY_EOD_DATASET_ID, "D1")
        .unwrap()
        .unwrap();
    assert_eq!(entry.row_count, 1);
    assert_eq!(entry.content_hash, result.published_snapshot.content_hash);
    assert_eq!(entry.source_set, vec!["stub".to_string()]);

    // Run metadata is written once.
    let meta = read_ingest_run_meta(&config.raw_root, "ing_20240103_060000Z_0001").unwrap();
    assert_eq!(meta.config_fingerprint.len(), 64);

    // No hard errors for a clean bar.
    assert!(result.validation_report.hard_errors.is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn rerun_of_same_version_fails_without_registry_mutation() {
    let root = temp_root("rerun");
    let (universe, rules) = fixtures();
    let config = config(&root, "D1", "ing_20240103_060000Z_0001");
    let adapter = StubAdapter {
        payload: single_bar_payload(192.8),
        fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap(),
        forged_fingerprint: None,
    };

    run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap();
    let registry_before = fs::read_to_string(&config.registry_path).unwrap();

    // Second run for the same (dataset, version): a new run id gets past
    // the raw-payload guard, then the canonical store refuses the version.
    let config_again = config_with_run(&root, "ing_20240103_070000Z_0001");
    let err = run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config_again,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap_err();

    assert!(err.is_kind(marketlab_core::ErrorKind::Storage));
    assert!(err.to_string().contains("already exists"));
    assert_eq!(
        fs::read_to_string(&config.registry_path).unwrap(),
        registry_before
    );

    let _ = fs::remove_dir_all(&root);
}

fn config_with_run(root: &Path, run_id: &str) -> IngestionConfig {
    config(root, "D1", run_id)
}

#[test]
fn fingerprint_mismatch_aborts_before_any_write() {
    let root = temp_root("forged");
    let (universe, rules) = fixtures();
    let config = config(&root, "D1", "ing_20240103_060000Z_0001");
    let adapter = StubAdapter {
        payload: single_bar_payload(192.8),
        fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap(),
        forged_fingerprint: Some("forged".into()),
    };

    let err = run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap_err();

    assert!(err.is_kind(marketlab_core::ErrorKind::ProviderResponse));
    assert!(!config.raw_root.exists() || fs::read_dir(&config.raw_root).unwrap().next().is_none());
    assert!(!config.registry_path.exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn hard_validation_failure_aborts_without_registry_entry() {
    let root = temp_root("invalid");
    let (universe, rules) = fixtures();
    let config = config(&root, "D1", "ing_20240103_060000Z_0001");
    let adapter = StubAdapter {
        // Nonpositive close is a hard error.
        payload: single_bar_payload(-5.0),
        fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap(),
        forged_fingerprint: None,
    };

    let err = run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap_err();

    assert!(err.is_kind(marketlab_core::ErrorKind::Validation));
    // Raw payload was stored (it precedes validation), but nothing was
    // published or registered.
    assert!(config.raw_root.exists());
    assert!(!config.registry_path.exists());
    let canonical_version_dir = config
        .canonical_root
        .join(format!("dataset_id={EQUITY_EOD_DATASET_ID}"))
        .join("dataset_version=D1");
    assert!(!canonical_version_dir.exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unknown_instrument_is_a_normalization_error() {
    let root = temp_root("unknown");
    let (universe, rules) = fixtures();
    let config = config(&root, "D1", "ing_20240103_060000Z_0001");
    let adapter = StubAdapter {
        payload: serde_json::json!({
            "records": [{
                "mic": "XNYS",
                "vendor_symbol": "NOPE",
                "ts": "2024-01-02T21:00:00+00:00",
                "close": 10.0,
            }]
        }),
        fetched_at: Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap(),
        forged_fingerprint: None,
    };

    let err = run_ingestion(
        &request(),
        &adapter,
        &StubNormalizer,
        &config,
        &universe,
        &rules,
        &WeekdayCalendar,
        timestamps(),
    )
    .unwrap_err();

    assert!(err.is_kind(marketlab_core::ErrorKind::Normalization));
    assert!(!config.registry_path.exists());

    let _ = fs::remove_dir_all(&root);
}
