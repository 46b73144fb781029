//! Aligned frames: combination, calendar alignment, and frame-level
//! validation guardrails.
//!
//! An `AlignedFrame` is a date-indexed table with one f64 column per
//! (asset, field) pair; NaN marks a missing value. Domain logic stays in
//! plain Rust — parquet conversion happens at the storage boundary.

use crate::error::{DataError, Result};
use crate::quality::{FrameFlag, QualityReport, MAX_EXAMPLE_DATES};
use crate::request::{AssetId, DedupPolicy, FieldName, MissingDataPolicy, MissingPolicy, ValidationPolicy};
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};

/// One asset's rows as read from storage, on its own date index.
#[derive(Debug, Clone)]
pub struct AssetSeries {
    pub asset_id: AssetId,
    pub dates: Vec<NaiveDate>,
    pub fields: Vec<FieldName>,
    /// Column per field, each the same length as `dates`.
    pub columns: HashMap<FieldName, Vec<f64>>,
    pub vendor_symbol: Option<String>,
    pub ingestion_ts_utc: Option<String>,
}

impl AssetSeries {
    pub fn value(&self, row: usize, field: FieldName) -> f64 {
        self.columns
            .get(&field)
            .and_then(|col| col.get(row).copied())
            .unwrap_or(f64::NAN)
    }
}

/// Date-indexed table over (asset, field) columns.
#[derive(Debug, Clone)]
pub struct AlignedFrame {
    dates: Vec<NaiveDate>,
    assets: Vec<AssetId>,
    fields: Vec<FieldName>,
    columns: HashMap<(AssetId, FieldName), Vec<f64>>,
}

impl AlignedFrame {
    pub fn new(
        dates: Vec<NaiveDate>,
        assets: Vec<AssetId>,
        fields: Vec<FieldName>,
        columns: HashMap<(AssetId, FieldName), Vec<f64>>,
    ) -> Result<Self> {
        for asset in &assets {
            for field in &fields {
                let column = columns.get(&(asset.clone(), *field)).ok_or_else(|| {
                    DataError::validation("frame column missing")
                        .with("asset_id", asset.as_str())
                        .with("field", field.as_str())
                })?;
                if column.len() != dates.len() {
                    return Err(DataError::validation("frame column length mismatch")
                        .with("asset_id", asset.as_str())
                        .with("field", field.as_str())
                        .with("expected", dates.len())
                        .with("actual", column.len()));
                }
            }
        }
        Ok(Self {
            dates,
            assets,
            fields,
            columns,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[AssetId] {
        &self.assets
    }

    pub fn fields(&self) -> &[FieldName] {
        &self.fields
    }

    pub fn n_rows(&self) -> usize {
        self.dates.len()
    }

    pub fn column(&self, asset: &AssetId, field: FieldName) -> Result<&[f64]> {
        self.columns
            .get(&(asset.clone(), field))
            .map(Vec::as_slice)
            .ok_or_else(|| {
                DataError::validation("frame column missing")
                    .with("asset_id", asset.as_str())
                    .with("field", field.as_str())
            })
    }

    /// True when every value for this asset at `row` is NaN-free.
    fn row_complete(&self, asset: &AssetId, row: usize) -> bool {
        self.fields.iter().all(|field| {
            self.columns
                .get(&(asset.clone(), *field))
                .map(|col| !col[row].is_nan())
                .unwrap_or(false)
        })
    }

    fn select_rows(&self, keep: &[usize]) -> AlignedFrame {
        let dates = keep.iter().map(|&i| self.dates[i]).collect();
        let columns = self
            .columns
            .iter()
            .map(|(key, col)| {
                let selected: Vec<f64> = keep.iter().map(|&i| col[i]).collect();
                (key.clone(), selected)
            })
            .collect();
        AlignedFrame {
            dates,
            assets: self.assets.clone(),
            fields: self.fields.clone(),
            columns,
        }
    }

    pub fn is_monotonic_increasing(&self) -> bool {
        self.dates.windows(2).all(|pair| pair[0] < pair[1])
    }

    fn has_duplicate_dates(&self) -> bool {
        let unique: BTreeSet<_> = self.dates.iter().collect();
        unique.len() != self.dates.len()
    }
}

/// NaN-aware equality: a NaN cell equals a NaN cell. This is what makes
/// "aligning twice yields an identical table" a testable statement.
impl PartialEq for AlignedFrame {
    fn eq(&self, other: &Self) -> bool {
        if self.dates != other.dates
            || self.assets != other.assets
            || self.fields != other.fields
        {
            return false;
        }
        self.columns.iter().all(|(key, col)| {
            other.columns.get(key).is_some_and(|other_col| {
                col.len() == other_col.len()
                    && col
                        .iter()
                        .zip(other_col)
                        .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
            })
        })
    }
}

/// Combine per-asset series onto the union of their dates, in the given
/// asset order. Missing rows become NaN. Each input index must be
/// duplicate-free.
pub fn combine_asset_series(
    series: &HashMap<AssetId, AssetSeries>,
    assets: &[AssetId],
    fields: &[FieldName],
) -> Result<AlignedFrame> {
    let mut all_dates: BTreeSet<NaiveDate> = BTreeSet::new();
    for asset in assets {
        let entry = series.get(asset).ok_or_else(|| {
            DataError::validation("asset series missing").with("asset_id", asset.as_str())
        })?;
        let unique: BTreeSet<_> = entry.dates.iter().collect();
        if unique.len() != entry.dates.len() {
            return Err(DataError::validation("asset series contains duplicate dates")
                .with("asset_id", asset.as_str()));
        }
        all_dates.extend(entry.dates.iter().copied());
    }
    let dates: Vec<NaiveDate> = all_dates.into_iter().collect();

    let mut columns: HashMap<(AssetId, FieldName), Vec<f64>> = HashMap::new();
    for asset in assets {
        let entry = &series[asset];
        let row_of: HashMap<NaiveDate, usize> = entry
            .dates
            .iter()
            .enumerate()
            .map(|(i, d)| (*d, i))
            .collect();
        for field in fields {
            let column: Vec<f64> = dates
                .iter()
                .map(|date| {
                    row_of
                        .get(date)
                        .map(|&row| entry.value(row, *field))
                        .unwrap_or(f64::NAN)
                })
                .collect();
            columns.insert((asset.clone(), *field), column);
        }
    }

    AlignedFrame::new(dates, assets.to_vec(), fields.to_vec(), columns)
}

/// Align a frame to the target dates and apply the missing-data policy.
///
/// Target dates must be unique and sorted ascending; the source index must
/// be duplicate-free. Idempotent: aligning an already-aligned frame to the
/// same target returns an identical frame.
pub fn align_frame(
    frame: &AlignedFrame,
    target_dates: &[NaiveDate],
    missing: &MissingDataPolicy,
) -> Result<AlignedFrame> {
    check_target_index(target_dates)?;
    if frame.has_duplicate_dates() {
        return Err(DataError::validation("frame index contains duplicate dates")
            .with("duplicate_dates", duplicate_examples(&frame.dates)));
    }

    let row_of: HashMap<NaiveDate, usize> = frame
        .dates
        .iter()
        .enumerate()
        .map(|(i, d)| (*d, i))
        .collect();

    let columns: HashMap<(AssetId, FieldName), Vec<f64>> = frame
        .columns
        .iter()
        .map(|(key, col)| {
            let reindexed: Vec<f64> = target_dates
                .iter()
                .map(|date| row_of.get(date).map(|&row| col[row]).unwrap_or(f64::NAN))
                .collect();
            (key.clone(), reindexed)
        })
        .collect();

    let aligned = AlignedFrame {
        dates: target_dates.to_vec(),
        assets: frame.assets.clone(),
        fields: frame.fields.clone(),
        columns,
    };

    match missing.policy {
        MissingPolicy::NanOk => Ok(aligned),
        MissingPolicy::DropDates => {
            let keep: Vec<usize> = (0..aligned.n_rows())
                .filter(|&row| aligned.assets.iter().all(|a| aligned.row_complete(a, row)))
                .collect();
            Ok(aligned.select_rows(&keep))
        }
        MissingPolicy::Error => {
            let missing_dates: Vec<String> = (0..aligned.n_rows())
                .filter(|&row| !aligned.assets.iter().all(|a| aligned.row_complete(a, row)))
                .map(|row| aligned.dates[row].to_string())
                .collect();
            if missing_dates.is_empty() {
                Ok(aligned)
            } else {
                Err(DataError::validation("aligned frame has missing values")
                    .with("missing_count", missing_dates.len())
                    .with(
                        "missing_dates",
                        serde_json::json!(missing_dates
                            .iter()
                            .take(MAX_EXAMPLE_DATES)
                            .collect::<Vec<_>>()),
                    ))
            }
        }
    }
}

fn check_target_index(target_dates: &[NaiveDate]) -> Result<()> {
    let unique: BTreeSet<_> = target_dates.iter().collect();
    if unique.len() != target_dates.len() {
        return Err(DataError::validation("target_dates must be unique")
            .with("duplicate_dates", duplicate_examples(target_dates)));
    }
    if !target_dates.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(DataError::validation(
            "target_dates must be monotonic increasing",
        ));
    }
    Ok(())
}

fn duplicate_examples(dates: &[NaiveDate]) -> serde_json::Value {
    let mut seen = BTreeSet::new();
    let mut duplicates = Vec::new();
    for date in dates {
        if !seen.insert(*date) && !duplicates.contains(&date.to_string()) {
            duplicates.push(date.to_string());
            if duplicates.len() >= MAX_EXAMPLE_DATES {
                break;
            }
        }
    }
    serde_json::json!(duplicates)
}

/// Frame-level validation: dedup, index guardrails, per-asset coverage and
/// price/return guardrails. Returns the (possibly deduplicated) frame and
/// a quality report. Soft issues become flags; hard policy violations
/// return errors.
pub fn validate_and_flag(
    frame: &AlignedFrame,
    policy: &ValidationPolicy,
) -> Result<(AlignedFrame, QualityReport)> {
    policy.validate()?;

    let mut report = QualityReport::default();

    let (frame, duplicates_removed) = deduplicate(frame, policy)?;
    if duplicates_removed > 0 {
        report
            .actions
            .insert("deduplicate".into(), policy.deduplicate.as_str().into());
        tracing::info!(
            duplicate_count = duplicates_removed,
            policy = policy.deduplicate.as_str(),
            "frame deduplicated"
        );
    }

    let total_rows = frame.n_rows();
    if !frame.is_monotonic_increasing() && total_rows > 1 {
        if policy.monotonic_index {
            return Err(DataError::validation(
                "aligned frame index must be monotonic increasing",
            ));
        }
        for asset in frame.assets() {
            report.record_flag(
                asset,
                FrameFlag::NonmonotonicIndex,
                1,
                frame
                    .dates()
                    .iter()
                    .take(MAX_EXAMPLE_DATES)
                    .map(|d| d.to_string())
                    .collect(),
            );
        }
    }

    for asset in frame.assets() {
        let missing_rows: Vec<usize> = (0..total_rows)
            .filter(|&row| !frame.row_complete(asset, row))
            .collect();
        let coverage = if total_rows > 0 {
            (total_rows - missing_rows.len()) as f64 / total_rows as f64
        } else {
            0.0
        };
        report.coverage.insert(asset.clone(), coverage);
        report.record_flag(
            asset,
            FrameFlag::Missing,
            missing_rows.len() as u64,
            missing_rows
                .iter()
                .map(|&row| frame.dates()[row].to_string())
                .collect(),
        );

        let nonpositive_rows = nonpositive_price_rows(&frame, asset);
        if !nonpositive_rows.is_empty() {
            if policy.no_nonpositive_prices {
                tracing::warn!(
                    asset_id = asset.as_str(),
                    count = nonpositive_rows.len(),
                    "nonpositive price detected"
                );
                return Err(DataError::validation("nonpositive price detected")
                    .with("asset_id", asset.as_str())
                    .with("count", nonpositive_rows.len()));
            }
            report.record_flag(
                asset,
                FrameFlag::NonpositivePrice,
                nonpositive_rows.len() as u64,
                nonpositive_rows
                    .iter()
                    .map(|&row| frame.dates()[row].to_string())
                    .collect(),
            );
        }

        if frame.fields().contains(&FieldName::Close) {
            let close = frame.column(asset, FieldName::Close)?;
            let returns = simple_returns(close);

            let corp_rows: Vec<usize> = returns
                .iter()
                .enumerate()
                .filter(|(_, r)| r.abs() >= policy.corp_action_jump_threshold)
                .map(|(row, _)| row)
                .collect();
            if !corp_rows.is_empty() {
                tracing::info!(
                    asset_id = asset.as_str(),
                    count = corp_rows.len(),
                    "suspect corporate action"
                );
            }
            report.record_flag(
                asset,
                FrameFlag::SuspectCorpAction,
                corp_rows.len() as u64,
                corp_rows
                    .iter()
                    .map(|&row| frame.dates()[row].to_string())
                    .collect(),
            );

            if let Some(max_abs) = policy.max_abs_return {
                let outlier_rows: Vec<usize> = returns
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.abs() >= max_abs)
                    .map(|(row, _)| row)
                    .collect();
                report.record_flag(
                    asset,
                    FrameFlag::OutlierReturn,
                    outlier_rows.len() as u64,
                    outlier_rows
                        .iter()
                        .map(|&row| frame.dates()[row].to_string())
                        .collect(),
                );
            }
        }

        if duplicates_removed > 0 {
            report.record_flag(asset, FrameFlag::DuplicateResolved, duplicates_removed, vec![]);
        }
    }

    report.validate()?;
    Ok((frame, report))
}

fn deduplicate(frame: &AlignedFrame, policy: &ValidationPolicy) -> Result<(AlignedFrame, u64)> {
    if !frame.has_duplicate_dates() {
        return Ok((frame.clone(), 0));
    }
    if policy.deduplicate == DedupPolicy::Error {
        return Err(DataError::validation("frame index contains duplicate dates")
            .with("duplicate_dates", duplicate_examples(frame.dates())));
    }
    let mut chosen: HashMap<NaiveDate, usize> = HashMap::new();
    for (row, date) in frame.dates().iter().enumerate() {
        match policy.deduplicate {
            // keep the last occurrence
            DedupPolicy::Last => {
                chosen.insert(*date, row);
            }
            DedupPolicy::First => {
                chosen.entry(*date).or_insert(row);
            }
            DedupPolicy::Error => unreachable!("handled above"),
        }
    }
    let mut keep: Vec<usize> = Vec::new();
    let mut emitted: BTreeSet<NaiveDate> = BTreeSet::new();
    for (row, date) in frame.dates().iter().enumerate() {
        if chosen.get(date) == Some(&row) && emitted.insert(*date) {
            keep.push(row);
        }
    }
    let removed = (frame.n_rows() - keep.len()) as u64;
    Ok((frame.select_rows(&keep), removed))
}

fn nonpositive_price_rows(frame: &AlignedFrame, asset: &AssetId) -> Vec<usize> {
    let price_fields: Vec<FieldName> = frame
        .fields()
        .iter()
        .copied()
        .filter(|f| f.is_price())
        .collect();
    if price_fields.is_empty() {
        return vec![];
    }
    (0..frame.n_rows())
        .filter(|&row| {
            price_fields.iter().any(|field| {
                let value = frame
                    .column(asset, *field)
                    .map(|col| col[row])
                    .unwrap_or(f64::NAN);
                !value.is_nan() && value <= 0.0
            })
        })
        .collect()
}

/// Simple returns over positive closes; rows without a usable previous
/// close get NaN (never flagged).
fn simple_returns(close: &[f64]) -> Vec<f64> {
    let mut returns = vec![f64::NAN; close.len()];
    let mut prev: Option<f64> = None;
    for (row, &value) in close.iter().enumerate() {
        let current = if value.is_nan() || value <= 0.0 {
            None
        } else {
            Some(value)
        };
        if let (Some(p), Some(c)) = (prev, current) {
            returns[row] = c / p - 1.0;
        }
        if current.is_some() {
            prev = current;
        }
    }
    returns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn close_frame(dates: Vec<&str>, closes: Vec<f64>) -> AlignedFrame {
        let asset = AssetId::new("EQ:SPY");
        let mut columns = HashMap::new();
        columns.insert((asset.clone(), FieldName::Close), closes);
        AlignedFrame::new(
            dates.into_iter().map(date).collect(),
            vec![asset],
            vec![FieldName::Close],
            columns,
        )
        .unwrap()
    }

    #[test]
    fn combine_unions_dates_with_nan_fill() {
        let spy = AssetSeries {
            asset_id: AssetId::new("EQ:SPY"),
            dates: vec![date("2024-01-02"), date("2024-01-03")],
            fields: vec![FieldName::Close],
            columns: HashMap::from([(FieldName::Close, vec![100.0, 101.0])]),
            vendor_symbol: None,
            ingestion_ts_utc: None,
        };
        let qqq = AssetSeries {
            asset_id: AssetId::new("EQ:QQQ"),
            dates: vec![date("2024-01-03")],
            fields: vec![FieldName::Close],
            columns: HashMap::from([(FieldName::Close, vec![200.0])]),
            vendor_symbol: None,
            ingestion_ts_utc: None,
        };
        let series = HashMap::from([
            (spy.asset_id.clone(), spy),
            (qqq.asset_id.clone(), qqq),
        ]);
        let assets = vec![AssetId::new("EQ:SPY"), AssetId::new("EQ:QQQ")];

        let frame = combine_asset_series(&series, &assets, &[FieldName::Close]).unwrap();
        assert_eq!(frame.n_rows(), 2);
        let qqq_close = frame.column(&AssetId::new("EQ:QQQ"), FieldName::Close).unwrap();
        assert!(qqq_close[0].is_nan());
        assert_eq!(qqq_close[1], 200.0);
    }

    #[test]
    fn align_is_idempotent() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-04"],
            vec![100.0, 101.0],
        );
        let target = vec![date("2024-01-02"), date("2024-01-03"), date("2024-01-04")];
        let missing = MissingDataPolicy::default();

        let once = align_frame(&frame, &target, &missing).unwrap();
        let twice = align_frame(&once, &target, &missing).unwrap();
        assert_eq!(once, twice);
        assert!(twice.is_monotonic_increasing());
    }

    #[test]
    fn align_drop_dates_removes_incomplete_rows() {
        let frame = close_frame(vec!["2024-01-02"], vec![100.0]);
        let target = vec![date("2024-01-02"), date("2024-01-03")];
        let missing = MissingDataPolicy {
            policy: MissingPolicy::DropDates,
            ..MissingDataPolicy::default()
        };

        let aligned = align_frame(&frame, &target, &missing).unwrap();
        assert_eq!(aligned.dates(), &[date("2024-01-02")]);
    }

    #[test]
    fn align_error_policy_raises_on_gap() {
        let frame = close_frame(vec!["2024-01-02"], vec![100.0]);
        let target = vec![date("2024-01-02"), date("2024-01-03")];
        let missing = MissingDataPolicy {
            policy: MissingPolicy::Error,
            ..MissingDataPolicy::default()
        };

        let err = align_frame(&frame, &target, &missing).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn align_rejects_unsorted_target() {
        let frame = close_frame(vec!["2024-01-02"], vec![100.0]);
        let target = vec![date("2024-01-03"), date("2024-01-02")];
        assert!(align_frame(&frame, &target, &MissingDataPolicy::default()).is_err());
    }

    #[test]
    fn dedup_last_keeps_final_row() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-02", "2024-01-03"],
            vec![100.0, 105.0, 101.0],
        );
        let policy = ValidationPolicy::default();

        let (deduped, report) = validate_and_flag(&frame, &policy).unwrap();
        assert_eq!(deduped.n_rows(), 2);
        let close = deduped.column(&AssetId::new("EQ:SPY"), FieldName::Close).unwrap();
        assert_eq!(close[0], 105.0);
        assert_eq!(report.actions["deduplicate"], "LAST");
        assert_eq!(
            report.flag_counts[&AssetId::new("EQ:SPY")][&FrameFlag::DuplicateResolved],
            1
        );
    }

    #[test]
    fn dedup_error_policy_raises() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-02"],
            vec![100.0, 105.0],
        );
        let policy = ValidationPolicy {
            deduplicate: DedupPolicy::Error,
            ..ValidationPolicy::default()
        };
        assert!(validate_and_flag(&frame, &policy).is_err());
    }

    #[test]
    fn nonpositive_price_raises_by_default() {
        let frame = close_frame(vec!["2024-01-02", "2024-01-03"], vec![100.0, -5.0]);
        assert!(validate_and_flag(&frame, &ValidationPolicy::default()).is_err());
    }

    #[test]
    fn nonpositive_price_flags_when_allowed() {
        let frame = close_frame(vec!["2024-01-02", "2024-01-03"], vec![100.0, -5.0]);
        let policy = ValidationPolicy {
            no_nonpositive_prices: false,
            ..ValidationPolicy::default()
        };
        let (_, report) = validate_and_flag(&frame, &policy).unwrap();
        assert_eq!(
            report.flag_counts[&AssetId::new("EQ:SPY")][&FrameFlag::NonpositivePrice],
            1
        );
    }

    #[test]
    fn corp_action_jump_is_flagged_with_examples() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-03", "2024-01-04"],
            vec![100.0, 100.0, 45.0],
        );
        let (_, report) = validate_and_flag(&frame, &ValidationPolicy::default()).unwrap();
        let asset = AssetId::new("EQ:SPY");
        assert_eq!(report.flag_counts[&asset][&FrameFlag::SuspectCorpAction], 1);
        assert_eq!(
            report.flag_examples[&asset][&FrameFlag::SuspectCorpAction],
            vec!["2024-01-04".to_string()]
        );
    }

    #[test]
    fn coverage_counts_missing_rows() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05"],
            vec![100.0, f64::NAN, 101.0, 102.0],
        );
        let (_, report) = validate_and_flag(&frame, &ValidationPolicy::default()).unwrap();
        let asset = AssetId::new("EQ:SPY");
        assert_eq!(report.coverage[&asset], 0.75);
        assert_eq!(report.flag_counts[&asset][&FrameFlag::Missing], 1);
    }

    #[test]
    fn outlier_return_respects_threshold() {
        let frame = close_frame(
            vec!["2024-01-02", "2024-01-03"],
            vec![100.0, 112.0],
        );
        let policy = ValidationPolicy {
            max_abs_return: Some(0.10),
            ..ValidationPolicy::default()
        };
        let (_, report) = validate_and_flag(&frame, &policy).unwrap();
        assert_eq!(
            report.flag_counts[&AssetId::new("EQ:SPY")][&FrameFlag::OutlierReturn],
            1
        );
    }
}
