//! Per-asset market data store with year partitioning.
//!
//! Layout: `{root}/market/{provider}/{asset}/{frequency}/part-{year}.parquet`
//!
//! Writes group rows by year and replace whole partitions via a .tmp +
//! rename; reads concatenate the year partitions for the requested
//! window, reject duplicate dates, and require the requested fields.

use crate::layout::{asset_cache_path, asset_dir, DEFAULT_FREQUENCY};
use marketlab_core::error::{DataError, Result};
use marketlab_core::frame::AssetSeries;
use marketlab_core::request::{AssetId, FieldName};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// One daily row handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EodRow {
    pub date: NaiveDate,
    pub values: BTreeMap<FieldName, f64>,
}

/// Required provenance for every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMeta {
    pub vendor_symbol: String,
    pub ingestion_ts_utc: String,
    pub provider: String,
}

/// Partitioned parquet store for per-asset daily rows.
#[derive(Debug, Clone)]
pub struct ParquetMarketDataStore {
    root: PathBuf,
}

impl ParquetMarketDataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Write one asset's rows into year partitions. Rows must be
    /// duplicate-free by date; they are sorted before writing.
    pub fn write_asset_frame(
        &self,
        asset_id: &AssetId,
        rows: &[EodRow],
        fields: &[FieldName],
        meta: &WriteMeta,
    ) -> Result<Vec<PathBuf>> {
        if rows.is_empty() {
            return Err(DataError::storage("cannot store empty asset frame")
                .with("asset_id", asset_id.as_str()));
        }
        if meta.vendor_symbol.is_empty() || meta.ingestion_ts_utc.is_empty() {
            return Err(DataError::storage(
                "meta must include vendor_symbol and ingestion_ts_utc",
            ));
        }
        if meta.provider.is_empty() {
            return Err(DataError::storage("provider must be supplied"));
        }

        let mut sorted: Vec<&EodRow> = rows.iter().collect();
        sorted.sort_by_key(|row| row.date);
        for pair in sorted.windows(2) {
            if pair[0].date == pair[1].date {
                return Err(DataError::storage("frame index contains duplicate dates")
                    .with("asset_id", asset_id.as_str())
                    .with("date", pair[0].date.to_string()));
            }
        }

        let mut by_year: BTreeMap<i32, Vec<&EodRow>> = BTreeMap::new();
        for row in &sorted {
            by_year.entry(row.date.year()).or_default().push(*row);
        }

        let dir = asset_dir(&self.root, &meta.provider, asset_id, DEFAULT_FREQUENCY)?;
        fs::create_dir_all(&dir).map_err(|e| {
            DataError::storage("failed to create asset cache dir")
                .with("path", dir.display().to_string())
                .with_cause(e)
        })?;

        let mut written: Vec<PathBuf> = Vec::new();
        for (year, year_rows) in &by_year {
            let mut df = rows_to_dataframe(year_rows, fields, meta)?;
            let target =
                asset_cache_path(&self.root, &meta.provider, asset_id, *year, DEFAULT_FREQUENCY)?;
            let tmp = target.with_extension("parquet.tmp");

            let file = fs::File::create(&tmp).map_err(|e| {
                DataError::storage("failed to write parquet")
                    .with("path", tmp.display().to_string())
                    .with_cause(e)
            })?;
            ParquetWriter::new(file).finish(&mut df).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                DataError::storage("failed to write parquet")
                    .with("path", tmp.display().to_string())
                    .with_cause(e)
            })?;
            // Partition replacement is atomic: readers see old or new bytes.
            fs::rename(&tmp, &target).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                DataError::storage("atomic rename failed")
                    .with("path", target.display().to_string())
                    .with_cause(e)
            })?;
            written.push(target);
        }
        Ok(written)
    }

    /// Read the requested window for each asset, as per-asset series on
    /// their own date index.
    pub fn read_assets(
        &self,
        asset_ids: &[AssetId],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[FieldName],
        provider: &str,
    ) -> Result<HashMap<AssetId, AssetSeries>> {
        if start > end {
            return Err(DataError::validation("start must be on or before end")
                .with("start", start.to_string())
                .with("end", end.to_string()));
        }
        if provider.is_empty() {
            return Err(DataError::storage("provider must be supplied"));
        }

        let mut results = HashMap::new();
        for asset_id in asset_ids {
            let folder = asset_dir(&self.root, provider, asset_id, DEFAULT_FREQUENCY)?;
            if !folder.exists() {
                return Err(DataError::storage("asset cache missing")
                    .with("asset_id", asset_id.as_str())
                    .with("provider", provider));
            }

            let mut frames: Vec<DataFrame> = Vec::new();
            for year in start.year()..=end.year() {
                let part =
                    asset_cache_path(&self.root, provider, asset_id, year, DEFAULT_FREQUENCY)?;
                if part.exists() {
                    frames.push(read_parquet(&part)?);
                }
            }
            if frames.is_empty() {
                return Err(DataError::storage("no cached parquet partitions found")
                    .with("asset_id", asset_id.as_str())
                    .with("provider", provider));
            }

            results.insert(
                asset_id.clone(),
                frames_to_series(asset_id, frames, start, end, fields)?,
            );
        }
        Ok(results)
    }

}

// ── Parquet I/O helpers ──────────────────────────────────────────────

fn rows_to_dataframe(rows: &[&EodRow], fields: &[FieldName], meta: &WriteMeta) -> Result<DataFrame> {
    let dates: Vec<String> = rows.iter().map(|row| row.date.to_string()).collect();
    let count = rows.len();

    let mut columns = vec![Column::new("date".into(), dates)];
    for field in fields {
        let values: Vec<f64> = rows
            .iter()
            .map(|row| row.values.get(field).copied().unwrap_or(f64::NAN))
            .collect();
        columns.push(Column::new(field.as_str().into(), values));
    }
    columns.push(Column::new(
        "vendor_symbol".into(),
        vec![meta.vendor_symbol.clone(); count],
    ));
    columns.push(Column::new(
        "ingestion_ts_utc".into(),
        vec![meta.ingestion_ts_utc.clone(); count],
    ));

    DataFrame::new(columns)
        .map_err(|e| DataError::storage("dataframe creation failed").with_cause(e))
}

fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = fs::File::open(path).map_err(|e| {
        DataError::storage("failed to read parquet")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;
    let df = ParquetReader::new(file).finish().map_err(|e| {
        DataError::storage("failed to read parquet")
            .with("path", path.display().to_string())
            .with_cause(e)
    })?;
    if df.height() == 0 {
        return Err(DataError::storage("empty parquet partition")
            .with("path", path.display().to_string()));
    }
    Ok(df)
}

fn frames_to_series(
    asset_id: &AssetId,
    frames: Vec<DataFrame>,
    start: NaiveDate,
    end: NaiveDate,
    fields: &[FieldName],
) -> Result<AssetSeries> {
    struct Row {
        date: NaiveDate,
        values: Vec<f64>,
        vendor_symbol: Option<String>,
        ingestion_ts: Option<String>,
    }

    let mut rows: Vec<Row> = Vec::new();
    for df in &frames {
        let dates = df.column("date").and_then(|c| c.str()).map_err(|e| {
            DataError::storage("cached parquet missing date column")
                .with("asset_id", asset_id.as_str())
                .with_cause(e)
        })?;
        let mut field_cols = Vec::with_capacity(fields.len());
        for field in fields {
            let col = df.column(field.as_str()).and_then(|c| c.f64()).map_err(|e| {
                DataError::storage("cached parquet missing requested fields")
                    .with("asset_id", asset_id.as_str())
                    .with("field", field.as_str())
                    .with_cause(e)
            })?;
            field_cols.push(col);
        }
        let vendor = df.column("vendor_symbol").and_then(|c| c.str()).ok();
        let ingestion = df.column("ingestion_ts_utc").and_then(|c| c.str()).ok();

        for row in 0..df.height() {
            let raw_date = dates.get(row).ok_or_else(|| {
                DataError::storage("cached parquet has null date")
                    .with("asset_id", asset_id.as_str())
            })?;
            let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d").map_err(|e| {
                DataError::storage("cached parquet date invalid")
                    .with("value", raw_date)
                    .with_cause(e)
            })?;
            rows.push(Row {
                date,
                values: field_cols
                    .iter()
                    .map(|col| col.get(row).unwrap_or(f64::NAN))
                    .collect(),
                vendor_symbol: vendor.as_ref().and_then(|c| c.get(row)).map(str::to_string),
                ingestion_ts: ingestion.as_ref().and_then(|c| c.get(row)).map(str::to_string),
            });
        }
    }

    rows.sort_by_key(|row| row.date);
    for pair in rows.windows(2) {
        if pair[0].date == pair[1].date {
            return Err(DataError::storage("cached parquet contains duplicate dates")
                .with("asset_id", asset_id.as_str())
                .with("date", pair[0].date.to_string()));
        }
    }
    rows.retain(|row| row.date >= start && row.date <= end);

    // Provenance columns must be constant across the slice.
    let vendor_symbol = constant_value(
        rows.iter().filter_map(|row| row.vendor_symbol.clone()),
        "vendor_symbol",
    )?;
    let ingestion_ts_utc = constant_value(
        rows.iter().filter_map(|row| row.ingestion_ts.clone()),
        "ingestion_ts_utc",
    )?;

    let dates: Vec<NaiveDate> = rows.iter().map(|row| row.date).collect();
    let mut columns: HashMap<FieldName, Vec<f64>> = HashMap::new();
    for (i, field) in fields.iter().enumerate() {
        columns.insert(*field, rows.iter().map(|row| row.values[i]).collect());
    }

    Ok(AssetSeries {
        asset_id: asset_id.clone(),
        dates,
        fields: fields.to_vec(),
        columns,
        vendor_symbol,
        ingestion_ts_utc,
    })
}

fn constant_value(values: impl Iterator<Item = String>, name: &str) -> Result<Option<String>> {
    let mut unique: Vec<String> = values.collect();
    unique.sort();
    unique.dedup();
    match unique.len() {
        0 => Ok(None),
        1 => Ok(unique.pop()),
        _ => Err(DataError::storage(format!("{name} values are inconsistent"))
            .with("values", serde_json::json!(unique))),
    }
}
