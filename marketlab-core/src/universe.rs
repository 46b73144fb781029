//! Instrument master universe snapshots.
//!
//! The universe seed is a JSON file of equity and FX-spot instruments.
//! Instrument ids are fingerprints of the natural key, and the snapshot
//! hash pins the exact membership a dataset was built against.

use crate::error::{DataError, Result};
use crate::fingerprint::{fingerprint_json, CanonicalValue};
use crate::records::require_non_empty;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentType {
    #[serde(rename = "EQUITY")]
    Equity,
    #[serde(rename = "FX_SPOT")]
    FxSpot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DELISTED")]
    Delisted,
}

/// One instrument master row. Equity and FX rows populate different
/// optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub instrument_id: String,
    pub instrument_type: InstrumentType,
    pub status: InstrumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker_norm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ccy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_ccy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_code: Option<String>,
}

pub fn normalize_ccy(value: &str) -> Result<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.len() != 3 || !normalized.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DataError::validation("currency must be an ISO 4217 code")
            .with("value", value));
    }
    Ok(normalized)
}

pub fn normalize_ticker(value: &str) -> Result<String> {
    require_non_empty(value, "ticker")?;
    Ok(value.trim().to_uppercase())
}

pub fn normalize_mic(value: &str) -> Result<String> {
    require_non_empty(value, "mic")?;
    Ok(value.trim().to_uppercase())
}

/// Deterministic instrument id from the natural key, e.g.
/// `EQUITY|XNYS|SPY|USD` or `FX_SPOT|EUR|USD`.
pub fn generate_instrument_id(natural_key: &str) -> String {
    let value = CanonicalValue::string(natural_key);
    format!("inst_{}", &crate::fingerprint::fingerprint(&value)[..16])
}

/// Immutable universe snapshot with its membership hash.
#[derive(Debug, Clone, PartialEq)]
pub struct UniverseSnapshot {
    pub version: String,
    pub instruments: Vec<InstrumentRecord>,
    pub universe_hash: String,
}

impl UniverseSnapshot {
    pub fn new(version: impl Into<String>, instruments: Vec<InstrumentRecord>) -> Result<Self> {
        let version = version.into();
        require_non_empty(&version, "version")?;
        if instruments.is_empty() {
            return Err(DataError::validation("instruments must not be empty"));
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for record in &instruments {
            if !seen.insert(&record.instrument_id) {
                return Err(DataError::validation("instrument_id values must be unique")
                    .with("instrument_id", record.instrument_id.clone()));
            }
        }
        let universe_hash = compute_universe_hash(&instruments)?;
        Ok(Self {
            version,
            instruments,
            universe_hash,
        })
    }

    pub fn by_instrument_id(&self) -> HashMap<&str, &InstrumentRecord> {
        self.instruments
            .iter()
            .map(|record| (record.instrument_id.as_str(), record))
            .collect()
    }

    /// Lookup for equity normalizers: (mic, vendor symbol) → instrument.
    pub fn equity_lookup(&self) -> HashMap<(String, String), &InstrumentRecord> {
        self.instruments
            .iter()
            .filter(|r| r.instrument_type == InstrumentType::Equity)
            .filter_map(|r| {
                let mic = r.mic.clone()?;
                let vendor = r.vendor_symbol.clone()?;
                Some(((mic, vendor), r))
            })
            .collect()
    }

    /// Lookup for FX normalizers: (base, quote) → instrument.
    pub fn fx_lookup(&self) -> HashMap<(String, String), &InstrumentRecord> {
        self.instruments
            .iter()
            .filter(|r| r.instrument_type == InstrumentType::FxSpot)
            .filter_map(|r| {
                let base = r.base_ccy.clone()?;
                let quote = r.quote_ccy.clone()?;
                Some(((base, quote), r))
            })
            .collect()
    }
}

/// Membership hash: instruments sorted by id, fingerprinted.
pub fn compute_universe_hash(instruments: &[InstrumentRecord]) -> Result<String> {
    let mut sorted: Vec<&InstrumentRecord> = instruments.iter().collect();
    sorted.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
    let payload = serde_json::json!({
        "instruments": sorted
            .iter()
            .map(|record| serde_json::to_value(record))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DataError::validation("instrument serialization failed").with_cause(e))?,
    });
    Ok(fingerprint_json(&payload))
}

#[derive(Debug, Deserialize)]
struct UniverseSeed {
    version: String,
    #[serde(default)]
    equities: Vec<EquitySeed>,
    #[serde(default)]
    fx_spot: Vec<FxSeed>,
}

#[derive(Debug, Deserialize)]
struct EquitySeed {
    mic: String,
    vendor_symbol: String,
    ticker: Option<String>,
    currency: String,
    timezone: String,
    status: Option<InstrumentStatus>,
}

#[derive(Debug, Deserialize)]
struct FxSeed {
    base_ccy: String,
    quote_ccy: String,
    pair_code: Option<String>,
    status: Option<InstrumentStatus>,
}

/// Load a universe snapshot from a JSON seed file.
pub fn load_seed_universe(path: &Path) -> Result<UniverseSnapshot> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DataError::storage("failed to read universe seed")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;
    let seed: UniverseSeed = serde_json::from_str(&raw).map_err(|e| {
        DataError::storage("invalid universe seed")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;

    let mut instruments = Vec::new();
    for entry in &seed.equities {
        let mic = normalize_mic(&entry.mic)?;
        let ticker_raw = entry.ticker.clone().unwrap_or_else(|| entry.vendor_symbol.clone());
        let ticker_norm = normalize_ticker(&ticker_raw)?;
        let currency = normalize_ccy(&entry.currency)?;
        require_non_empty(&entry.timezone, "timezone")?;
        let natural_key = format!("EQUITY|{mic}|{ticker_norm}|{currency}");
        instruments.push(InstrumentRecord {
            instrument_id: generate_instrument_id(&natural_key),
            instrument_type: InstrumentType::Equity,
            status: entry.status.unwrap_or(InstrumentStatus::Active),
            ticker_raw: Some(ticker_raw),
            ticker_norm: Some(ticker_norm),
            vendor_symbol: Some(entry.vendor_symbol.clone()),
            mic: Some(mic),
            currency: Some(currency),
            exchange_timezone: Some(entry.timezone.trim().to_string()),
            base_ccy: None,
            quote_ccy: None,
            pair_code: None,
        });
    }
    for entry in &seed.fx_spot {
        let base = normalize_ccy(&entry.base_ccy)?;
        let quote = normalize_ccy(&entry.quote_ccy)?;
        let pair_code = entry
            .pair_code
            .clone()
            .unwrap_or_else(|| format!("{base}{quote}"));
        let natural_key = format!("FX_SPOT|{base}|{quote}");
        instruments.push(InstrumentRecord {
            instrument_id: generate_instrument_id(&natural_key),
            instrument_type: InstrumentType::FxSpot,
            status: entry.status.unwrap_or(InstrumentStatus::Active),
            ticker_raw: None,
            ticker_norm: None,
            vendor_symbol: None,
            mic: None,
            currency: None,
            exchange_timezone: None,
            base_ccy: Some(base),
            quote_ccy: Some(quote),
            pair_code: Some(pair_code),
        });
    }

    UniverseSnapshot::new(seed.version, instruments)
}

/// Build a small in-memory universe; used by tests and fixtures.
pub fn universe_from_parts(
    version: &str,
    equities: Vec<(&str, &str, &str, &str)>,
    fx: Vec<(&str, &str)>,
) -> Result<UniverseSnapshot> {
    let mut instruments = Vec::new();
    for (mic, vendor_symbol, currency, timezone) in equities {
        let mic = normalize_mic(mic)?;
        let ticker_norm = normalize_ticker(vendor_symbol)?;
        let currency = normalize_ccy(currency)?;
        let natural_key = format!("EQUITY|{mic}|{ticker_norm}|{currency}");
        instruments.push(InstrumentRecord {
            instrument_id: generate_instrument_id(&natural_key),
            instrument_type: InstrumentType::Equity,
            status: InstrumentStatus::Active,
            ticker_raw: Some(vendor_symbol.to_string()),
            ticker_norm: Some(ticker_norm),
            vendor_symbol: Some(vendor_symbol.to_string()),
            mic: Some(mic),
            currency: Some(currency),
            exchange_timezone: Some(timezone.to_string()),
            base_ccy: None,
            quote_ccy: None,
            pair_code: None,
        });
    }
    for (base, quote) in fx {
        let base = normalize_ccy(base)?;
        let quote = normalize_ccy(quote)?;
        let natural_key = format!("FX_SPOT|{base}|{quote}");
        instruments.push(InstrumentRecord {
            instrument_id: generate_instrument_id(&natural_key),
            instrument_type: InstrumentType::FxSpot,
            status: InstrumentStatus::Active,
            ticker_raw: None,
            ticker_norm: None,
            vendor_symbol: None,
            mic: None,
            currency: None,
            exchange_timezone: None,
            base_ccy: Some(base.clone()),
            quote_ccy: Some(quote.clone()),
            pair_code: Some(format!("{base}{quote}")),
        });
    }
    UniverseSnapshot::new(version, instruments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_universe() -> UniverseSnapshot {
        universe_from_parts(
            "2024-01",
            vec![("XNYS", "SPY", "USD", "America/New_York")],
            vec![("EUR", "USD")],
        )
        .unwrap()
    }

    #[test]
    fn hash_is_order_invariant() {
        let a = sample_universe();
        let mut reversed = a.instruments.clone();
        reversed.reverse();
        let b = UniverseSnapshot::new("2024-01", reversed).unwrap();
        assert_eq!(a.universe_hash, b.universe_hash);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let a = sample_universe();
        let mut doubled = a.instruments.clone();
        doubled.push(doubled[0].clone());
        assert!(UniverseSnapshot::new("2024-01", doubled).is_err());
    }

    #[test]
    fn equity_lookup_finds_by_mic_and_symbol() {
        let universe = sample_universe();
        let lookup = universe.equity_lookup();
        let record = lookup.get(&("XNYS".to_string(), "SPY".to_string())).unwrap();
        assert_eq!(record.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn bad_currency_rejected() {
        assert!(normalize_ccy("usd4").is_err());
        assert_eq!(normalize_ccy("usd").unwrap(), "USD");
    }

    #[test]
    fn instrument_ids_are_stable() {
        let a = generate_instrument_id("EQUITY|XNYS|SPY|USD");
        let b = generate_instrument_id("EQUITY|XNYS|SPY|USD");
        assert_eq!(a, b);
        assert!(a.starts_with("inst_"));
    }

    #[test]
    fn seed_file_loads_and_normalizes() {
        let path = std::env::temp_dir().join(format!(
            "marketlab_universe_seed_{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            serde_json::json!({
                "version": "2024-01",
                "equities": [
                    {"mic": "xnys", "vendor_symbol": "SPY", "currency": "usd",
                     "timezone": "America/New_York"}
                ],
                "fx_spot": [
                    {"base_ccy": "eur", "quote_ccy": "usd"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let universe = load_seed_universe(&path).unwrap();
        assert_eq!(universe.instruments.len(), 2);
        let equity = &universe.instruments[0];
        assert_eq!(equity.mic.as_deref(), Some("XNYS"));
        assert_eq!(equity.currency.as_deref(), Some("USD"));
        let fx = &universe.instruments[1];
        assert_eq!(fx.pair_code.as_deref(), Some("EURUSD"));
        assert_eq!(universe.universe_hash.len(), 64);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_seed_is_a_storage_error() {
        let path = std::env::temp_dir().join(format!(
            "marketlab_universe_bad_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "not json").unwrap();
        assert!(load_seed_universe(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
