//! Time-series request model and order-invariant request hashing.
//!
//! A `TimeSeriesRequest` fully describes an aligned view: assets, window,
//! fields, calendar, and the alignment/missing/validation policies. Its
//! hash is computed over a canonicalized form (sorted assets, sorted
//! fields, sorted keys), so permuting inputs never busts the cache.

use crate::error::{DataError, Result};
use crate::fingerprint::{fingerprint_json, format_utc, parse_utc};
use crate::records::require_non_empty;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable asset identifier, e.g. `EQ:SPY` or `FX:EURUSD`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Requestable daily fields.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FieldName {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "volume")]
    Volume,
}

impl FieldName {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Open => "open",
            FieldName::High => "high",
            FieldName::Low => "low",
            FieldName::Close => "close",
            FieldName::Volume => "volume",
        }
    }

    /// Price fields participate in the nonpositive-price guardrail.
    pub fn is_price(self) -> bool {
        !matches!(self, FieldName::Volume)
    }
}

/// Market calendar selection for time series requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSpec {
    pub kind: CalendarKind,
    pub market: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarKind {
    #[serde(rename = "MARKET")]
    Market,
}

impl CalendarSpec {
    pub fn market(market: impl Into<String>) -> Result<Self> {
        let spec = Self {
            kind: CalendarKind::Market,
            market: market.into(),
        };
        require_non_empty(&spec.market, "market")?;
        Ok(spec)
    }
}

/// How raw data is aligned to a target calendar index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentPolicy {
    pub index_mode: IndexMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexMode {
    #[serde(rename = "TARGET_CALENDAR")]
    TargetCalendar,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            index_mode: IndexMode::TargetCalendar,
        }
    }
}

/// What to do with dates the provider did not cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingPolicy {
    #[serde(rename = "NAN_OK")]
    NanOk,
    #[serde(rename = "DROP_DATES")]
    DropDates,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetDropPolicy {
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "DROP_ASSET")]
    DropAsset,
}

/// Controls how missing data is handled after calendar alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingDataPolicy {
    pub policy: MissingPolicy,
    pub min_coverage: f64,
    pub asset_drop_policy: AssetDropPolicy,
}

impl Default for MissingDataPolicy {
    fn default() -> Self {
        Self {
            policy: MissingPolicy::NanOk,
            min_coverage: 0.98,
            asset_drop_policy: AssetDropPolicy::Error,
        }
    }
}

impl MissingDataPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_coverage > 0.0 && self.min_coverage <= 1.0) {
            return Err(DataError::validation("min_coverage must be in (0, 1]")
                .with("min_coverage", self.min_coverage));
        }
        Ok(())
    }
}

/// Deduplication behavior when the index carries repeated dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupPolicy {
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "LAST")]
    Last,
    #[serde(rename = "FIRST")]
    First,
}

impl DedupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupPolicy::Error => "ERROR",
            DedupPolicy::Last => "LAST",
            DedupPolicy::First => "FIRST",
        }
    }
}

/// Controls validation and guardrail behavior for aligned data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub no_nonpositive_prices: bool,
    pub deduplicate: DedupPolicy,
    pub max_abs_return: Option<f64>,
    pub corp_action_jump_threshold: f64,
    pub monotonic_index: bool,
    pub type_checks: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            no_nonpositive_prices: true,
            deduplicate: DedupPolicy::Last,
            max_abs_return: None,
            corp_action_jump_threshold: 0.40,
            monotonic_index: true,
            type_checks: true,
        }
    }
}

impl ValidationPolicy {
    pub fn validate(&self) -> Result<()> {
        if let Some(max_abs) = self.max_abs_return {
            if max_abs <= 0.0 {
                return Err(DataError::validation("max_abs_return must be positive when set")
                    .with("max_abs_return", max_abs));
            }
        }
        if self.corp_action_jump_threshold <= 0.0 {
            return Err(
                DataError::validation("corp_action_jump_threshold must be positive")
                    .with("corp_action_jump_threshold", self.corp_action_jump_threshold),
            );
        }
        Ok(())
    }
}

/// Canonical request for aligned daily market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRequest {
    pub assets: Vec<AssetId>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub frequency: String,
    pub fields: BTreeSet<FieldName>,
    pub price_type: String,
    pub calendar: CalendarSpec,
    pub timezone: String,
    pub alignment: AlignmentPolicy,
    pub missing: MissingDataPolicy,
    pub validate: ValidationPolicy,
    pub as_of: Option<DateTime<Utc>>,
}

impl TimeSeriesRequest {
    /// Daily request with default policies and a close-only field set.
    pub fn daily(
        assets: Vec<AssetId>,
        start: NaiveDate,
        end: NaiveDate,
        calendar: CalendarSpec,
    ) -> Result<Self> {
        let request = Self {
            assets,
            start,
            end,
            frequency: "1D".into(),
            fields: BTreeSet::from([FieldName::Close]),
            price_type: "raw".into(),
            calendar,
            timezone: "UTC".into(),
            alignment: AlignmentPolicy::default(),
            missing: MissingDataPolicy::default(),
            validate: ValidationPolicy::default(),
            as_of: None,
        };
        request.check()?;
        Ok(request)
    }

    pub fn check(&self) -> Result<()> {
        if self.assets.is_empty() {
            return Err(DataError::validation("assets must be non-empty"));
        }
        if self.start > self.end {
            return Err(DataError::validation("start must be on or before end")
                .with("start", self.start.to_string())
                .with("end", self.end.to_string()));
        }
        if self.frequency != "1D" {
            return Err(
                DataError::validation("frequency must be 1D").with("frequency", self.frequency.clone())
            );
        }
        if self.fields.is_empty() {
            return Err(DataError::validation("fields must be non-empty"));
        }
        if self.price_type != "raw" {
            return Err(DataError::validation("price_type must be raw")
                .with("price_type", self.price_type.clone()));
        }
        if self.timezone != "UTC" {
            return Err(DataError::validation("timezone must be UTC for metadata")
                .with("timezone", self.timezone.clone()));
        }
        self.missing.validate()?;
        self.validate.validate()?;
        Ok(())
    }

    /// Request as a JSON payload, asset order preserved. This is what goes
    /// into lineage so replay can restore the exact request.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        let mut payload = serde_json::to_value(self).map_err(|e| {
            DataError::validation("request serialization failed").with_cause(e)
        })?;
        if let Some(as_of) = self.as_of {
            payload["as_of"] = serde_json::Value::String(format_utc(as_of));
        }
        Ok(payload)
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let mut normalized = payload.clone();
        // as_of is persisted in offset form; serde's chrono support parses
        // it, but validate the offset requirement explicitly first.
        if let Some(serde_json::Value::String(raw)) = payload.get("as_of") {
            parse_utc(raw, "as_of")?;
            normalized["as_of"] = serde_json::Value::String(raw.clone());
        }
        let request: TimeSeriesRequest = serde_json::from_value(normalized)
            .map_err(|e| DataError::validation("request payload invalid").with_cause(e))?;
        request.check()?;
        Ok(request)
    }

    /// Canonical, order-invariant form used for hashing: assets sorted,
    /// fields sorted (the set already is), keys sorted by the writer.
    pub fn canonical_payload(&self) -> Result<serde_json::Value> {
        let mut payload = self.to_payload()?;
        let mut assets: Vec<String> = self.assets.iter().map(|a| a.as_str().to_string()).collect();
        assets.sort();
        payload["assets"] = serde_json::json!(assets);
        Ok(payload)
    }
}

/// SHA-256 of the canonical request representation. Invariant under
/// permutation of the asset list and the field set.
pub fn request_hash(request: &TimeSeriesRequest) -> Result<String> {
    request.check()?;
    Ok(fingerprint_json(&request.canonical_payload()?))
}
