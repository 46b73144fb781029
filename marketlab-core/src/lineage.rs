//! Lineage metadata and the served bundle.
//!
//! Lineage records the provenance of a served result — provider, fetch
//! time, dataset version, storage paths, and the original request payload
//! — and is what cache manifests persist.

use crate::error::{DataError, Result};
use crate::frame::AlignedFrame;
use crate::quality::QualityReport;
use crate::records::require_non_empty;
use crate::request::AssetId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lineage metadata for market data requests and cache manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageMeta {
    pub request_hash: String,
    /// The original request as a JSON payload; replay restores it from here.
    pub request_json: serde_json::Value,
    pub provider: String,
    pub ingestion_ts_utc: String,
    pub as_of_utc: Option<String>,
    pub dataset_version: String,
    pub code_version: Option<String>,
    /// Sorted POSIX-style paths of every partition backing the result.
    pub storage_paths: Vec<String>,
}

impl LineageMeta {
    pub fn validate(&self) -> Result<()> {
        require_non_empty(&self.request_hash, "request_hash")?;
        require_non_empty(&self.provider, "provider")?;
        require_non_empty(&self.ingestion_ts_utc, "ingestion_ts_utc")?;
        require_non_empty(&self.dataset_version, "dataset_version")?;
        Ok(())
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "request_hash": self.request_hash,
            "request_json": self.request_json,
            "provider": self.provider,
            "ingestion_ts_utc": self.ingestion_ts_utc,
            "as_of_utc": self.as_of_utc,
            "dataset_version": self.dataset_version,
            "code_version": self.code_version,
            "storage_paths": self.storage_paths,
        })
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let lineage: LineageMeta = serde_json::from_value(payload.clone())
            .map_err(|e| DataError::storage("lineage payload invalid").with_cause(e))?;
        lineage.validate()?;
        Ok(lineage)
    }
}

/// Per-asset provenance attached to a served bundle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetMeta {
    pub provider: String,
    pub provider_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_ts_utc: Option<String>,
}

/// Aligned, validated time series bundle with lineage and quality metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesBundle {
    pub data: AlignedFrame,
    pub assets_meta: BTreeMap<AssetId, AssetMeta>,
    pub quality: QualityReport,
    pub lineage: LineageMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lineage() -> LineageMeta {
        LineageMeta {
            request_hash: "abc123".into(),
            request_json: serde_json::json!({"assets": ["EQ:SPY"]}),
            provider: "stub".into(),
            ingestion_ts_utc: "2024-01-04T00:00:00+00:00".into(),
            as_of_utc: None,
            dataset_version: "2024-01-03".into(),
            code_version: None,
            storage_paths: vec!["market/stub/EQ_SPY/1D/part-2024.parquet".into()],
        }
    }

    #[test]
    fn payload_roundtrip() {
        let lineage = sample_lineage();
        let back = LineageMeta::from_payload(&lineage.to_payload()).unwrap();
        assert_eq!(lineage, back);
    }

    #[test]
    fn empty_provider_rejected() {
        let mut lineage = sample_lineage();
        lineage.provider = String::new();
        assert!(lineage.validate().is_err());
    }

    #[test]
    fn payload_keeps_nulls_for_optional_fields() {
        let payload = sample_lineage().to_payload();
        assert!(payload.get("as_of_utc").is_some());
        assert!(payload["as_of_utc"].is_null());
        assert!(payload["code_version"].is_null());
    }
}
