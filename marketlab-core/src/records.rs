//! Canonical record model.
//!
//! A `CanonicalRecord` is one validated observation: an OHLCV bar for the
//! equity end-of-day dataset or a named point (fixing, bid, ask) for the FX
//! daily dataset. Records are immutable once built; the only sanctioned
//! change is flag merging during validation, which produces a new record
//! with the flag union and every other field untouched.

use crate::error::{DataError, Result};
use crate::quality::QualityFlag;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const EQUITY_EOD_DATASET_ID: &str = "md.equity.eod.bars";
pub const FX_DAILY_DATASET_ID: &str = "md.fx.spot.daily";
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Where a record came from: provider plus endpoint, optionally the
/// provider's own dataset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub provider: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_dataset: Option<String>,
}

impl Source {
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let source = Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            provider_dataset: None,
        };
        require_non_empty(&source.provider, "provider")?;
        require_non_empty(&source.endpoint, "endpoint")?;
        Ok(source)
    }

    pub fn with_provider_dataset(mut self, provider_dataset: impl Into<String>) -> Result<Self> {
        let value = provider_dataset.into();
        require_non_empty(&value, "provider_dataset")?;
        self.provider_dataset = Some(value);
        Ok(self)
    }
}

/// How the event timestamp was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampProvenance {
    #[serde(rename = "EXCHANGE_CLOSE")]
    ExchangeClose,
    #[serde(rename = "PROVIDER_EOD")]
    ProviderEod,
    #[serde(rename = "PROVIDER_ASOF")]
    ProviderAsof,
}

impl TimestampProvenance {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampProvenance::ExchangeClose => "EXCHANGE_CLOSE",
            TimestampProvenance::ProviderEod => "PROVIDER_EOD",
            TimestampProvenance::ProviderAsof => "PROVIDER_ASOF",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "EXCHANGE_CLOSE" => Ok(TimestampProvenance::ExchangeClose),
            "PROVIDER_EOD" => Ok(TimestampProvenance::ProviderEod),
            "PROVIDER_ASOF" => Ok(TimestampProvenance::ProviderAsof),
            other => Err(DataError::validation("ts_provenance is invalid").with("value", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentBasis {
    #[serde(rename = "SPLIT_ONLY")]
    SplitOnly,
    #[serde(rename = "SPLIT_AND_DIVIDEND")]
    SplitAndDividend,
    #[serde(rename = "PROVIDER_DEFINED")]
    ProviderDefined,
}

impl AdjustmentBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentBasis::SplitOnly => "SPLIT_ONLY",
            AdjustmentBasis::SplitAndDividend => "SPLIT_AND_DIVIDEND",
            AdjustmentBasis::ProviderDefined => "PROVIDER_DEFINED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "SPLIT_ONLY" => Ok(AdjustmentBasis::SplitOnly),
            "SPLIT_AND_DIVIDEND" => Ok(AdjustmentBasis::SplitAndDividend),
            "PROVIDER_DEFINED" => Ok(AdjustmentBasis::ProviderDefined),
            other => Err(DataError::validation("adjustment_basis is invalid").with("value", other)),
        }
    }
}

/// Daily OHLCV payload. Only the close is mandatory; providers differ on
/// the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adj_close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment_basis: Option<AdjustmentBasis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment_note: Option<String>,
}

impl Bar {
    pub fn from_close(close: f64) -> Self {
        Self {
            close,
            open: None,
            high: None,
            low: None,
            volume: None,
            adj_close: None,
            adjustment_basis: None,
            adjustment_note: None,
        }
    }

    /// True when any adjusted-price information is present.
    pub fn is_adjusted(&self) -> bool {
        self.adj_close.is_some() || self.adjustment_basis.is_some()
    }
}

/// Named numeric observation for FX-style datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointObs {
    pub field: String,
    pub value: f64,
    pub base_ccy: String,
    pub quote_ccy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixing_convention: Option<String>,
}

impl PointObs {
    /// Field names compare case-insensitively after trimming.
    pub fn normalized_field(&self) -> String {
        self.field.trim().to_lowercase()
    }
}

/// Fields shared by every canonical record variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCore {
    pub dataset_id: String,
    pub schema_version: String,
    pub dataset_version: String,
    pub instrument_id: String,
    pub ts: DateTime<Utc>,
    pub asof_ts: DateTime<Utc>,
    pub ts_provenance: TimestampProvenance,
    pub source: Source,
    pub ingest_run_id: String,
    /// Ordered and duplicate-free; merged, never replaced.
    pub quality_flags: Vec<QualityFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trading_date_local: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone_local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl RecordCore {
    pub fn validate(&self) -> Result<()> {
        require_non_empty(&self.dataset_id, "dataset_id")?;
        require_non_empty(&self.schema_version, "schema_version")?;
        require_non_empty(&self.dataset_version, "dataset_version")?;
        require_non_empty(&self.instrument_id, "instrument_id")?;
        require_non_empty(&self.ingest_run_id, "ingest_run_id")?;
        let mut seen = Vec::new();
        for flag in &self.quality_flags {
            if seen.contains(flag) {
                return Err(DataError::validation("quality_flags must not contain duplicates")
                    .with("flag", flag.as_str()));
            }
            seen.push(*flag);
        }
        Ok(())
    }
}

/// One canonical observation, dispatched by dataset at the validation and
/// serialization boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type")]
pub enum CanonicalRecord {
    Bar { core: RecordCore, bar: Bar },
    Point { core: RecordCore, point: PointObs },
}

impl CanonicalRecord {
    pub fn bar(core: RecordCore, bar: Bar) -> Result<Self> {
        core.validate()?;
        Ok(CanonicalRecord::Bar { core, bar })
    }

    pub fn point(core: RecordCore, point: PointObs) -> Result<Self> {
        core.validate()?;
        require_non_empty(&point.field, "field")?;
        require_non_empty(&point.base_ccy, "base_ccy")?;
        require_non_empty(&point.quote_ccy, "quote_ccy")?;
        Ok(CanonicalRecord::Point { core, point })
    }

    pub fn core(&self) -> &RecordCore {
        match self {
            CanonicalRecord::Bar { core, .. } => core,
            CanonicalRecord::Point { core, .. } => core,
        }
    }

    pub fn as_bar(&self) -> Option<&Bar> {
        match self {
            CanonicalRecord::Bar { bar, .. } => Some(bar),
            CanonicalRecord::Point { .. } => None,
        }
    }

    pub fn as_point(&self) -> Option<&PointObs> {
        match self {
            CanonicalRecord::Point { point, .. } => Some(point),
            CanonicalRecord::Bar { .. } => None,
        }
    }

    /// New record with `additions` unioned into the flags, first-seen order
    /// preserved. Every other field is unchanged.
    pub fn with_merged_flags(&self, additions: &[QualityFlag]) -> CanonicalRecord {
        let mut merged = self.core().quality_flags.clone();
        for flag in additions {
            if !merged.contains(flag) {
                merged.push(*flag);
            }
        }
        let mut next = self.clone();
        match &mut next {
            CanonicalRecord::Bar { core, .. } => core.quality_flags = merged,
            CanonicalRecord::Point { core, .. } => core.quality_flags = merged,
        }
        next
    }
}

/// Shared guard for identifier-style fields.
pub fn require_non_empty(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(
            DataError::validation(format!("{name} must be a non-empty string")).with("field", name)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_core() -> RecordCore {
        RecordCore {
            dataset_id: EQUITY_EOD_DATASET_ID.into(),
            schema_version: SCHEMA_VERSION.into(),
            dataset_version: "D1".into(),
            instrument_id: "inst-1".into(),
            ts: Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            asof_ts: Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap(),
            ts_provenance: TimestampProvenance::ProviderEod,
            source: Source::new("stub", "eod").unwrap(),
            ingest_run_id: "ing_20240103_060000Z_0001".into(),
            quality_flags: vec![],
            trading_date_local: None,
            timezone_local: None,
            currency: Some("USD".into()),
            unit: None,
        }
    }

    #[test]
    fn empty_dataset_id_is_rejected() {
        let mut core = sample_core();
        core.dataset_id = String::new();
        assert!(CanonicalRecord::bar(core, Bar::from_close(100.0)).is_err());
    }

    #[test]
    fn flag_merge_preserves_order_and_dedupes() {
        let record = CanonicalRecord::bar(sample_core(), Bar::from_close(100.0)).unwrap();
        let merged = record.with_merged_flags(&[
            QualityFlag::Stale,
            QualityFlag::OutlierSuspect,
            QualityFlag::Stale,
        ]);
        assert_eq!(
            merged.core().quality_flags,
            vec![QualityFlag::Stale, QualityFlag::OutlierSuspect]
        );

        let again = merged.with_merged_flags(&[QualityFlag::Stale]);
        assert_eq!(again.core().quality_flags, merged.core().quality_flags);
    }

    #[test]
    fn flag_merge_changes_nothing_else() {
        let record = CanonicalRecord::bar(sample_core(), Bar::from_close(100.0)).unwrap();
        let merged = record.with_merged_flags(&[QualityFlag::AdjustedPricePresent]);
        assert_eq!(merged.core().instrument_id, record.core().instrument_id);
        assert_eq!(merged.as_bar().unwrap().close, 100.0);
    }

    #[test]
    fn serde_roundtrip_bar() {
        let record = CanonicalRecord::bar(sample_core(), Bar::from_close(192.8)).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: CanonicalRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn point_requires_currencies() {
        let point = PointObs {
            field: "fixing".into(),
            value: 1.08,
            base_ccy: String::new(),
            quote_ccy: "USD".into(),
            fixing_convention: None,
        };
        assert!(CanonicalRecord::point(sample_core(), point).is_err());
    }
}
