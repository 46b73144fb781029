//! Quality flag vocabularies and the reports that aggregate them.
//!
//! Record-level flags annotate individual canonical records during
//! ingestion; frame-level flags annotate aligned tables served by the
//! cache. Soft quality issues never raise — they are counted here.

use crate::error::{DataError, Result};
use crate::records::require_non_empty;
use crate::request::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standardized quality flag vocabulary for canonical records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityFlag {
    #[serde(rename = "MISSING_VALUE")]
    MissingValue,
    #[serde(rename = "STALE")]
    Stale,
    #[serde(rename = "OUTLIER_SUSPECT")]
    OutlierSuspect,
    #[serde(rename = "ADJUSTED_PRICE_PRESENT")]
    AdjustedPricePresent,
    #[serde(rename = "PROVIDER_TIMESTAMP_USED")]
    ProviderTimestampUsed,
    #[serde(rename = "IMPUTED")]
    Imputed,
    #[serde(rename = "CALENDAR_CONFLICT")]
    CalendarConflict,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::MissingValue => "MISSING_VALUE",
            QualityFlag::Stale => "STALE",
            QualityFlag::OutlierSuspect => "OUTLIER_SUSPECT",
            QualityFlag::AdjustedPricePresent => "ADJUSTED_PRICE_PRESENT",
            QualityFlag::ProviderTimestampUsed => "PROVIDER_TIMESTAMP_USED",
            QualityFlag::Imputed => "IMPUTED",
            QualityFlag::CalendarConflict => "CALENDAR_CONFLICT",
        }
    }
}

/// Structured validation report emitted once per record-level pass.
///
/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub dataset_id: String,
    pub dataset_version: String,
    pub ingest_run_id: String,
    pub generated_ts: DateTime<Utc>,
    pub total_records: usize,
    pub hard_errors: Vec<String>,
    pub flag_counts: BTreeMap<QualityFlag, u64>,
}

impl ValidationReport {
    pub fn new(
        dataset_id: impl Into<String>,
        dataset_version: impl Into<String>,
        ingest_run_id: impl Into<String>,
        generated_ts: DateTime<Utc>,
        total_records: usize,
        hard_errors: Vec<String>,
        flag_counts: BTreeMap<QualityFlag, u64>,
    ) -> Result<Self> {
        let report = Self {
            dataset_id: dataset_id.into(),
            dataset_version: dataset_version.into(),
            ingest_run_id: ingest_run_id.into(),
            generated_ts,
            total_records,
            hard_errors,
            flag_counts,
        };
        require_non_empty(&report.dataset_id, "dataset_id")?;
        require_non_empty(&report.dataset_version, "dataset_version")?;
        require_non_empty(&report.ingest_run_id, "ingest_run_id")?;
        Ok(report)
    }

    pub fn has_hard_errors(&self) -> bool {
        !self.hard_errors.is_empty()
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "dataset_id": self.dataset_id,
            "dataset_version": self.dataset_version,
            "ingest_run_id": self.ingest_run_id,
            "generated_ts": crate::fingerprint::format_utc(self.generated_ts),
            "total_records": self.total_records,
            "hard_errors": self.hard_errors,
            "flag_counts": self
                .flag_counts
                .iter()
                .map(|(flag, count)| (flag.as_str().to_string(), serde_json::json!(count)))
                .collect::<serde_json::Map<_, _>>(),
        })
    }
}

/// Quality flags emitted by frame-level validation and guardrails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FrameFlag {
    #[serde(rename = "MISSING")]
    Missing,
    #[serde(rename = "DUPLICATE_RESOLVED")]
    DuplicateResolved,
    #[serde(rename = "OUTLIER_RETURN")]
    OutlierReturn,
    #[serde(rename = "SUSPECT_CORP_ACTION")]
    SuspectCorpAction,
    #[serde(rename = "NONPOSITIVE_PRICE")]
    NonpositivePrice,
    #[serde(rename = "NONMONOTONIC_INDEX")]
    NonmonotonicIndex,
}

impl FrameFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameFlag::Missing => "MISSING",
            FrameFlag::DuplicateResolved => "DUPLICATE_RESOLVED",
            FrameFlag::OutlierReturn => "OUTLIER_RETURN",
            FrameFlag::SuspectCorpAction => "SUSPECT_CORP_ACTION",
            FrameFlag::NonpositivePrice => "NONPOSITIVE_PRICE",
            FrameFlag::NonmonotonicIndex => "NONMONOTONIC_INDEX",
        }
    }
}

/// Up to this many example dates are kept per flag in a quality report.
pub const MAX_EXAMPLE_DATES: usize = 5;

/// Aggregated quality metrics and example dates per asset, served with
/// every bundle and persisted inside cache manifests.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub coverage: BTreeMap<AssetId, f64>,
    pub flag_counts: BTreeMap<AssetId, BTreeMap<FrameFlag, u64>>,
    pub flag_examples: BTreeMap<AssetId, BTreeMap<FrameFlag, Vec<String>>>,
    /// Audit trail of actions taken, e.g. which deduplication rule fired.
    pub actions: BTreeMap<String, String>,
}

impl QualityReport {
    pub fn validate(&self) -> Result<()> {
        for (asset, value) in &self.coverage {
            if !(0.0..=1.0).contains(value) {
                return Err(DataError::validation("coverage must be in [0, 1]")
                    .with("asset_id", asset.as_str())
                    .with("value", *value));
            }
        }
        Ok(())
    }

    pub fn record_flag(
        &mut self,
        asset: &AssetId,
        flag: FrameFlag,
        count: u64,
        examples: Vec<String>,
    ) {
        if count == 0 {
            return;
        }
        *self
            .flag_counts
            .entry(asset.clone())
            .or_default()
            .entry(flag)
            .or_insert(0) += count;
        if !examples.is_empty() {
            self.flag_examples
                .entry(asset.clone())
                .or_default()
                .insert(flag, examples.into_iter().take(MAX_EXAMPLE_DATES).collect());
        }
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        // serde maps the enum keys through their rename strings.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
