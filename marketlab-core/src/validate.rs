//! Record-level validation engine.
//!
//! One pass over a batch of canonical records produces hard errors (which
//! block the batch unless the caller opts out) and per-record quality
//! flags (which never block). Records come back with flags merged and
//! nothing else changed.

use crate::error::{DataError, Result};
use crate::quality::{QualityFlag, ValidationReport};
use crate::records::{
    require_non_empty, Bar, CanonicalRecord, TimestampProvenance, EQUITY_EOD_DATASET_ID,
    FX_DAILY_DATASET_ID,
};
use crate::sessions::{CalendarBaseline, SessionRule, SessionRulesSnapshot};
use crate::universe::{InstrumentRecord, InstrumentType, UniverseSnapshot};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DEFAULT_EQUITY_OUTLIER_THRESHOLD: f64 = 0.30;
pub const DEFAULT_FX_OUTLIER_THRESHOLD: f64 = 0.05;
pub const DEFAULT_STALE_WINDOW: usize = 3;
pub const DEFAULT_CLOSE_TOLERANCE_SECONDS: i64 = 60;

/// Expected identity of every record in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub dataset_id: String,
    pub dataset_version: String,
    pub ingest_run_id: String,
}

impl ValidationContext {
    pub fn new(
        dataset_id: impl Into<String>,
        dataset_version: impl Into<String>,
        ingest_run_id: impl Into<String>,
    ) -> Result<Self> {
        let context = Self {
            dataset_id: dataset_id.into(),
            dataset_version: dataset_version.into(),
            ingest_run_id: ingest_run_id.into(),
        };
        require_non_empty(&context.dataset_id, "dataset_id")?;
        require_non_empty(&context.dataset_version, "dataset_version")?;
        require_non_empty(&context.ingest_run_id, "ingest_run_id")?;
        Ok(context)
    }
}

/// Collaborator bundle for calendar-conflict checks.
pub struct TimeSemanticsContext<'a> {
    pub universe: &'a UniverseSnapshot,
    pub sessionrules: &'a SessionRulesSnapshot,
    pub calendar: &'a dyn CalendarBaseline,
    pub close_tolerance_seconds: i64,
}

impl<'a> TimeSemanticsContext<'a> {
    pub fn new(
        universe: &'a UniverseSnapshot,
        sessionrules: &'a SessionRulesSnapshot,
        calendar: &'a dyn CalendarBaseline,
    ) -> Self {
        Self {
            universe,
            sessionrules,
            calendar,
            close_tolerance_seconds: DEFAULT_CLOSE_TOLERANCE_SECONDS,
        }
    }

    pub fn with_close_tolerance(mut self, seconds: i64) -> Result<Self> {
        if seconds < 0 {
            return Err(DataError::validation("close_tolerance_seconds must be >= 0")
                .with("close_tolerance_seconds", seconds));
        }
        self.close_tolerance_seconds = seconds;
        Ok(self)
    }
}

/// Tunables for one validation pass.
pub struct ValidationOptions<'a> {
    pub context: Option<ValidationContext>,
    pub generated_ts: Option<DateTime<Utc>>,
    pub equity_outlier_threshold: f64,
    pub fx_outlier_threshold: f64,
    pub stale_window: usize,
    pub time_context: Option<TimeSemanticsContext<'a>>,
    pub raise_on_hard_error: bool,
}

impl Default for ValidationOptions<'_> {
    fn default() -> Self {
        Self {
            context: None,
            generated_ts: None,
            equity_outlier_threshold: DEFAULT_EQUITY_OUTLIER_THRESHOLD,
            fx_outlier_threshold: DEFAULT_FX_OUTLIER_THRESHOLD,
            stale_window: DEFAULT_STALE_WINDOW,
            time_context: None,
            raise_on_hard_error: true,
        }
    }
}

/// Validate a batch of canonical records in original order.
pub fn validate_records(
    records: &[CanonicalRecord],
    options: ValidationOptions<'_>,
) -> Result<(Vec<CanonicalRecord>, ValidationReport)> {
    if options.stale_window < 2 {
        return Err(DataError::validation("stale_window must be >= 2")
            .with("stale_window", options.stale_window));
    }
    let context = match options.context {
        Some(context) => context,
        None => {
            let first = records.first().ok_or_else(|| {
                DataError::validation("records must not be empty when context is not provided")
            })?;
            ValidationContext::new(
                first.core().dataset_id.clone(),
                first.core().dataset_version.clone(),
                first.core().ingest_run_id.clone(),
            )?
        }
    };
    let generated_ts = options.generated_ts.unwrap_or_else(Utc::now);

    let mut hard_errors: Vec<String> = Vec::new();
    let mut additions: Vec<BTreeSet<QualityFlag>> = vec![BTreeSet::new(); records.len()];

    for (index, record) in records.iter().enumerate() {
        let core = record.core();
        if core.dataset_id != context.dataset_id {
            hard_errors.push(format!("record {index} dataset_id mismatch: {}", core.dataset_id));
        }
        if core.dataset_version != context.dataset_version {
            hard_errors.push(format!(
                "record {index} dataset_version mismatch: {}",
                core.dataset_version
            ));
        }
        if core.ingest_run_id != context.ingest_run_id {
            hard_errors.push(format!(
                "record {index} ingest_run_id mismatch: {}",
                core.ingest_run_id
            ));
        }

        match context.dataset_id.as_str() {
            EQUITY_EOD_DATASET_ID => {
                let Some(bar) = record.as_bar() else {
                    hard_errors.push(format!("record {index} expected bar record for equity dataset"));
                    continue;
                };
                if bar.is_adjusted() {
                    additions[index].insert(QualityFlag::AdjustedPricePresent);
                }
                check_bar_prices(index, bar, &mut hard_errors);
            }
            FX_DAILY_DATASET_ID => {
                let Some(point) = record.as_point() else {
                    hard_errors.push(format!("record {index} expected point record for fx dataset"));
                    continue;
                };
                if !is_positive_finite(point.value) {
                    hard_errors.push(format!("record {index} value must be finite and > 0"));
                }
                if !is_iso_ccy(&point.base_ccy) {
                    hard_errors.push(format!("record {index} base_ccy must be ISO 4217"));
                }
                if !is_iso_ccy(&point.quote_ccy) {
                    hard_errors.push(format!("record {index} quote_ccy must be ISO 4217"));
                }
            }
            other => {
                hard_errors.push(format!("unsupported dataset_id: {other}"));
                break;
            }
        }
    }

    if let Some(time_context) = &options.time_context {
        apply_time_semantics_flags(
            records,
            &mut additions,
            &mut hard_errors,
            &context.dataset_id,
            time_context,
        );
    }

    for (index, record) in records.iter().enumerate() {
        if record.core().ts_provenance != TimestampProvenance::ExchangeClose {
            additions[index].insert(QualityFlag::ProviderTimestampUsed);
        }
    }

    check_duplicates_and_spreads(records, &context.dataset_id, &mut hard_errors);

    match context.dataset_id.as_str() {
        EQUITY_EOD_DATASET_ID => apply_outlier_and_stale_flags(
            records,
            &mut additions,
            |record| record.core().instrument_id.clone(),
            |record| record.as_bar().map(|bar| bar.close),
            options.equity_outlier_threshold,
            options.stale_window,
        ),
        FX_DAILY_DATASET_ID => apply_outlier_and_stale_flags(
            records,
            &mut additions,
            |record| {
                let field = record
                    .as_point()
                    .map(|point| point.normalized_field())
                    .unwrap_or_default();
                format!("{}|{field}", record.core().instrument_id)
            },
            |record| record.as_point().map(|point| point.value),
            options.fx_outlier_threshold,
            options.stale_window,
        ),
        _ => {}
    }

    let validated: Vec<CanonicalRecord> = records
        .iter()
        .zip(&additions)
        .map(|(record, added)| {
            let added: Vec<QualityFlag> = added.iter().copied().collect();
            record.with_merged_flags(&added)
        })
        .collect();

    let mut flag_counts: BTreeMap<QualityFlag, u64> = BTreeMap::new();
    for record in &validated {
        for flag in &record.core().quality_flags {
            *flag_counts.entry(*flag).or_insert(0) += 1;
        }
    }

    let report = ValidationReport::new(
        context.dataset_id.clone(),
        context.dataset_version.clone(),
        context.ingest_run_id.clone(),
        generated_ts,
        validated.len(),
        hard_errors,
        flag_counts,
    )?;

    if report.has_hard_errors() && options.raise_on_hard_error {
        tracing::warn!(
            dataset_id = %context.dataset_id,
            hard_errors = report.hard_errors.len(),
            "record validation failed"
        );
        return Err(DataError::validation("validation failed")
            .with("report", report.to_payload()));
    }

    Ok((validated, report))
}

fn check_bar_prices(index: usize, bar: &Bar, hard_errors: &mut Vec<String>) {
    let prices = [
        ("open", bar.open),
        ("high", bar.high),
        ("low", bar.low),
        ("close", Some(bar.close)),
        ("adj_close", bar.adj_close),
    ];
    for (name, value) in prices {
        if let Some(value) = value {
            if !is_positive_finite(value) {
                hard_errors.push(format!("record {index} {name} must be finite and > 0"));
            }
        }
    }
    if let Some(volume) = bar.volume {
        if !(volume.is_finite() && volume >= 0.0) {
            hard_errors.push(format!("record {index} volume must be finite and >= 0"));
        }
    }

    // Range checks reference whichever of open/close are present.
    if let Some(high) = bar.high {
        let mut reference = bar.close;
        if let Some(open) = bar.open {
            reference = reference.max(open);
        }
        if high < reference {
            hard_errors.push(format!("record {index} high must be >= max(open, close)"));
        }
    }
    if let Some(low) = bar.low {
        let mut reference = bar.close;
        if let Some(open) = bar.open {
            reference = reference.min(open);
        }
        if low > reference {
            hard_errors.push(format!("record {index} low must be <= min(open, close)"));
        }
    }
    if let (Some(high), Some(low)) = (bar.high, bar.low) {
        if high < low {
            hard_errors.push(format!("record {index} high must be >= low"));
        }
    }
}

fn check_duplicates_and_spreads(
    records: &[CanonicalRecord],
    dataset_id: &str,
    hard_errors: &mut Vec<String>,
) {
    match dataset_id {
        EQUITY_EOD_DATASET_ID => {
            let mut seen: BTreeSet<(String, DateTime<Utc>)> = BTreeSet::new();
            for record in records {
                if record.as_bar().is_none() {
                    continue;
                }
                let core = record.core();
                let key = (core.instrument_id.clone(), core.ts);
                if !seen.insert(key) {
                    hard_errors.push(format!(
                        "duplicate record for {} at {}",
                        core.instrument_id,
                        core.ts.to_rfc3339()
                    ));
                }
            }
        }
        FX_DAILY_DATASET_ID => {
            let mut seen: BTreeSet<(String, String, DateTime<Utc>)> = BTreeSet::new();
            let mut bid_ask: HashMap<(String, DateTime<Utc>), (Option<f64>, Option<f64>)> =
                HashMap::new();
            for record in records {
                let Some(point) = record.as_point() else {
                    continue;
                };
                let core = record.core();
                let field = point.normalized_field();
                let key = (core.instrument_id.clone(), field.clone(), core.ts);
                if !seen.insert(key) {
                    hard_errors.push(format!(
                        "duplicate record for {}/{field} at {}",
                        core.instrument_id,
                        core.ts.to_rfc3339()
                    ));
                }
                if field == "bid" || field == "ask" {
                    let entry = bid_ask
                        .entry((core.instrument_id.clone(), core.ts))
                        .or_insert((None, None));
                    if field == "bid" {
                        entry.0 = Some(point.value);
                    } else {
                        entry.1 = Some(point.value);
                    }
                }
            }
            let mut inversions: Vec<(String, DateTime<Utc>)> = bid_ask
                .into_iter()
                .filter(|(_, (bid, ask))| matches!((bid, ask), (Some(b), Some(a)) if b > a))
                .map(|(key, _)| key)
                .collect();
            inversions.sort();
            for (instrument_id, ts) in inversions {
                hard_errors.push(format!(
                    "bid/ask inversion for {instrument_id} at {}",
                    ts.to_rfc3339()
                ));
            }
        }
        _ => {}
    }
}

/// Outlier and staleness flags per key group, entries ordered by
/// (ts, original index) for deterministic tie-breaks.
fn apply_outlier_and_stale_flags(
    records: &[CanonicalRecord],
    additions: &mut [BTreeSet<QualityFlag>],
    key_fn: impl Fn(&CanonicalRecord) -> String,
    value_fn: impl Fn(&CanonicalRecord) -> Option<f64>,
    outlier_threshold: f64,
    stale_window: usize,
) {
    let mut grouped: HashMap<String, Vec<(DateTime<Utc>, usize, f64)>> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        let Some(value) = value_fn(record) else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        grouped
            .entry(key_fn(record))
            .or_default()
            .push((record.core().ts, index, value));
    }

    for entries in grouped.values_mut() {
        entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let mut prev_value: Option<f64> = None;
        let mut stale_count = 0usize;
        for &(_, index, value) in entries.iter() {
            if let Some(prev) = prev_value {
                if prev > 0.0 {
                    let change = ((value - prev) / prev).abs();
                    if change > outlier_threshold {
                        additions[index].insert(QualityFlag::OutlierSuspect);
                    }
                }
            }
            if prev_value == Some(value) {
                stale_count += 1;
            } else {
                stale_count = 1;
            }
            if stale_count >= stale_window {
                additions[index].insert(QualityFlag::Stale);
            }
            prev_value = Some(value);
        }
    }
}

fn apply_time_semantics_flags(
    records: &[CanonicalRecord],
    additions: &mut [BTreeSet<QualityFlag>],
    hard_errors: &mut Vec<String>,
    dataset_id: &str,
    time_context: &TimeSemanticsContext<'_>,
) {
    if dataset_id != EQUITY_EOD_DATASET_ID {
        return;
    }
    let instrument_lookup = time_context.universe.by_instrument_id();

    for (index, record) in records.iter().enumerate() {
        if record.as_bar().is_none() {
            continue;
        }
        let core = record.core();
        let Some(&instrument) = instrument_lookup.get(core.instrument_id.as_str()) else {
            continue;
        };
        if instrument.instrument_type != InstrumentType::Equity {
            continue;
        }
        let Some(mic) = instrument.mic.as_deref() else {
            continue;
        };
        let Some(trading_date) = core.trading_date_local else {
            continue;
        };

        if !time_context.calendar.is_session_day(mic, trading_date) {
            additions[index].insert(QualityFlag::CalendarConflict);
        }

        let rule = time_context.sessionrules.rule_for(mic);
        if let Some(timezone_name) = resolve_timezone(core.timezone_local.as_deref(), instrument, rule)
        {
            match timezone_name.parse::<Tz>() {
                Ok(tz) => {
                    let local_date = core.ts.with_timezone(&tz).date_naive();
                    if local_date != trading_date {
                        additions[index].insert(QualityFlag::CalendarConflict);
                    }
                }
                Err(_) => {
                    hard_errors.push(format!(
                        "invalid timezone for instrument {}: {timezone_name}",
                        core.instrument_id
                    ));
                }
            }
        }

        if let Some(rule) = rule {
            match expected_close_ts(trading_date, rule) {
                Ok(Some(expected)) => {
                    let delta = (core.ts - expected).num_seconds().abs();
                    if delta > time_context.close_tolerance_seconds {
                        additions[index].insert(QualityFlag::CalendarConflict);
                    }
                }
                Ok(None) => {}
                Err(message) => hard_errors.push(message),
            }
        }
    }
}

fn resolve_timezone<'a>(
    record_timezone: Option<&'a str>,
    instrument: &'a InstrumentRecord,
    rule: Option<&'a SessionRule>,
) -> Option<&'a str> {
    if let Some(tz) = record_timezone {
        if !tz.is_empty() {
            return Some(tz);
        }
    }
    if let Some(rule) = rule {
        return Some(&rule.timezone_local);
    }
    instrument.exchange_timezone.as_deref()
}

/// Expected UTC close instant for a trading date under a session rule.
/// Ambiguous local times resolve to the earliest instant.
fn expected_close_ts(
    trading_date: NaiveDate,
    rule: &SessionRule,
) -> std::result::Result<Option<DateTime<Utc>>, String> {
    if !rule.in_effect(trading_date) {
        return Ok(None);
    }
    let close_time = rule
        .close_time()
        .map_err(|e| format!("failed to compute expected close time for {}: {e}", rule.mic))?;
    let tz: Tz = rule
        .timezone_local
        .parse()
        .map_err(|_| {
            format!(
                "failed to compute expected close time for {}: bad timezone {}",
                rule.mic, rule.timezone_local
            )
        })?;
    let local = trading_date.and_time(close_time);
    let resolved = tz
        .from_local_datetime(&local)
        .earliest()
        .ok_or_else(|| {
            format!(
                "failed to compute expected close time for {}: nonexistent local time",
                rule.mic
            )
        })?;
    Ok(Some(resolved.with_timezone(&Utc)))
}

fn is_positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn is_iso_ccy(value: &str) -> bool {
    value.len() == 3 && value.chars().all(|c| c.is_ascii_uppercase())
}
