//! Canonical records ⇄ parquet part bytes.
//!
//! Domain types stay plain Rust; polars appears only here, at the
//! serialization boundary. Column layout is fixed per record variant so a
//! snapshot's schema is stable across runs.

use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::{format_utc, parse_utc};
use marketlab_core::quality::QualityFlag;
use marketlab_core::records::{
    AdjustmentBasis, Bar, CanonicalRecord, PointObs, RecordCore, Source, TimestampProvenance,
};
use chrono::NaiveDate;
use polars::prelude::*;
use std::io::Cursor;

pub const FIRST_PART_NAME: &str = "part-0001.parquet";

/// Serialize validated records into named snapshot parts. One part today;
/// the naming scheme leaves room for splitting later.
pub fn build_canonical_parts(records: &[CanonicalRecord]) -> Result<Vec<(String, Vec<u8>)>> {
    Ok(vec![(FIRST_PART_NAME.to_string(), serialize_record_part(records)?)])
}

/// Records → parquet bytes with the fixed canonical column layout.
pub fn serialize_record_part(records: &[CanonicalRecord]) -> Result<Vec<u8>> {
    if records.is_empty() {
        return Err(DataError::storage("records must not be empty"));
    }
    let all_bars = records.iter().all(|r| r.as_bar().is_some());
    let all_points = records.iter().all(|r| r.as_point().is_some());
    if !all_bars && !all_points {
        return Err(DataError::storage("mixed record variants in canonical payload"));
    }

    let mut df = if all_bars {
        bars_to_dataframe(records)?
    } else {
        points_to_dataframe(records)?
    };

    let mut buffer: Vec<u8> = Vec::new();
    ParquetWriter::new(&mut buffer)
        .finish(&mut df)
        .map_err(|e| {
            DataError::storage("failed to serialize canonical parquet")
                .with("record_count", records.len())
                .with_cause(e)
        })?;
    Ok(buffer)
}

/// Parquet bytes → records; the inverse of `serialize_record_part`.
pub fn read_record_part(bytes: &[u8]) -> Result<Vec<CanonicalRecord>> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| DataError::storage("failed to read canonical parquet").with_cause(e))?;
    if df.column("bar_close").is_ok() {
        dataframe_to_bars(&df)
    } else if df.column("field").is_ok() {
        dataframe_to_points(&df)
    } else {
        Err(DataError::storage("canonical parquet has unknown layout"))
    }
}

// ── DataFrame conversion helpers ─────────────────────────────────────

fn common_columns(records: &[CanonicalRecord]) -> Result<Vec<Column>> {
    let cores: Vec<&RecordCore> = records.iter().map(|r| r.core()).collect();
    let flags: Vec<String> = cores
        .iter()
        .map(|core| {
            serde_json::to_string(&core.quality_flags)
                .map_err(|e| DataError::storage("failed to serialize quality flags").with_cause(e))
        })
        .collect::<Result<_>>()?;

    Ok(vec![
        Column::new(
            "dataset_id".into(),
            cores.iter().map(|c| c.dataset_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "schema_version".into(),
            cores.iter().map(|c| c.schema_version.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "dataset_version".into(),
            cores.iter().map(|c| c.dataset_version.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "instrument_id".into(),
            cores.iter().map(|c| c.instrument_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "ts".into(),
            cores.iter().map(|c| format_utc(c.ts)).collect::<Vec<_>>(),
        ),
        Column::new(
            "asof_ts".into(),
            cores.iter().map(|c| format_utc(c.asof_ts)).collect::<Vec<_>>(),
        ),
        Column::new(
            "ts_provenance".into(),
            cores
                .iter()
                .map(|c| c.ts_provenance.as_str().to_string())
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "source_provider".into(),
            cores.iter().map(|c| c.source.provider.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "source_endpoint".into(),
            cores.iter().map(|c| c.source.endpoint.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "source_provider_dataset".into(),
            cores
                .iter()
                .map(|c| c.source.provider_dataset.clone())
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "ingest_run_id".into(),
            cores.iter().map(|c| c.ingest_run_id.clone()).collect::<Vec<_>>(),
        ),
        Column::new("quality_flags".into(), flags),
        Column::new(
            "trading_date_local".into(),
            cores
                .iter()
                .map(|c| c.trading_date_local.map(|d| d.to_string()))
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "timezone_local".into(),
            cores
                .iter()
                .map(|c| c.timezone_local.clone())
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "currency".into(),
            cores.iter().map(|c| c.currency.clone()).collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "unit".into(),
            cores.iter().map(|c| c.unit.clone()).collect::<Vec<Option<String>>>(),
        ),
    ])
}

fn bars_to_dataframe(records: &[CanonicalRecord]) -> Result<DataFrame> {
    let bars: Vec<&Bar> = records.iter().filter_map(|r| r.as_bar()).collect();
    let mut columns = common_columns(records)?;
    columns.extend([
        Column::new(
            "bar_open".into(),
            bars.iter().map(|b| b.open).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "bar_high".into(),
            bars.iter().map(|b| b.high).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "bar_low".into(),
            bars.iter().map(|b| b.low).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "bar_close".into(),
            bars.iter().map(|b| b.close).collect::<Vec<f64>>(),
        ),
        Column::new(
            "bar_volume".into(),
            bars.iter().map(|b| b.volume).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "bar_adj_close".into(),
            bars.iter().map(|b| b.adj_close).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "bar_adjustment_basis".into(),
            bars.iter()
                .map(|b| b.adjustment_basis.map(|basis| basis.as_str().to_string()))
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "bar_adjustment_note".into(),
            bars.iter()
                .map(|b| b.adjustment_note.clone())
                .collect::<Vec<Option<String>>>(),
        ),
    ]);
    DataFrame::new(columns)
        .map_err(|e| DataError::storage("dataframe creation failed").with_cause(e))
}

fn points_to_dataframe(records: &[CanonicalRecord]) -> Result<DataFrame> {
    let points: Vec<&PointObs> = records.iter().filter_map(|r| r.as_point()).collect();
    let mut columns = common_columns(records)?;
    columns.extend([
        Column::new(
            "field".into(),
            points.iter().map(|p| p.field.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "value".into(),
            points.iter().map(|p| p.value).collect::<Vec<f64>>(),
        ),
        Column::new(
            "base_ccy".into(),
            points.iter().map(|p| p.base_ccy.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "quote_ccy".into(),
            points.iter().map(|p| p.quote_ccy.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "fixing_convention".into(),
            points
                .iter()
                .map(|p| p.fixing_convention.clone())
                .collect::<Vec<Option<String>>>(),
        ),
    ]);
    DataFrame::new(columns)
        .map_err(|e| DataError::storage("dataframe creation failed").with_cause(e))
}

struct ColumnReader<'a> {
    df: &'a DataFrame,
}

impl<'a> ColumnReader<'a> {
    fn str_col(&self, name: &str) -> Result<&'a StringChunked> {
        self.df
            .column(name)
            .and_then(|c| c.str())
            .map_err(|e| {
                DataError::storage("canonical parquet missing column")
                    .with("column", name)
                    .with_cause(e)
            })
    }

    fn f64_col(&self, name: &str) -> Result<&'a Float64Chunked> {
        self.df
            .column(name)
            .and_then(|c| c.f64())
            .map_err(|e| {
                DataError::storage("canonical parquet missing column")
                    .with("column", name)
                    .with_cause(e)
            })
    }

    fn required_str(&self, name: &str, row: usize) -> Result<String> {
        self.str_col(name)?
            .get(row)
            .map(str::to_string)
            .ok_or_else(|| {
                DataError::storage("canonical parquet has null value")
                    .with("column", name)
                    .with("row", row)
            })
    }

    fn optional_str(&self, name: &str, row: usize) -> Result<Option<String>> {
        Ok(self.str_col(name)?.get(row).map(str::to_string))
    }

    fn required_f64(&self, name: &str, row: usize) -> Result<f64> {
        self.f64_col(name)?.get(row).ok_or_else(|| {
            DataError::storage("canonical parquet has null value")
                .with("column", name)
                .with("row", row)
        })
    }

    fn optional_f64(&self, name: &str, row: usize) -> Result<Option<f64>> {
        Ok(self.f64_col(name)?.get(row))
    }
}

fn read_core(reader: &ColumnReader<'_>, row: usize) -> Result<RecordCore> {
    let flags_raw = reader.required_str("quality_flags", row)?;
    let quality_flags: Vec<QualityFlag> = serde_json::from_str(&flags_raw)
        .map_err(|e| DataError::storage("quality flags payload invalid").with_cause(e))?;
    let trading_date_local = reader
        .optional_str("trading_date_local", row)?
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                DataError::storage("trading_date_local invalid")
                    .with("value", raw.clone())
                    .with_cause(e)
            })
        })
        .transpose()?;
    let provider_dataset = reader.optional_str("source_provider_dataset", row)?;
    let mut source = Source::new(
        reader.required_str("source_provider", row)?,
        reader.required_str("source_endpoint", row)?,
    )?;
    if let Some(provider_dataset) = provider_dataset {
        source = source.with_provider_dataset(provider_dataset)?;
    }

    Ok(RecordCore {
        dataset_id: reader.required_str("dataset_id", row)?,
        schema_version: reader.required_str("schema_version", row)?,
        dataset_version: reader.required_str("dataset_version", row)?,
        instrument_id: reader.required_str("instrument_id", row)?,
        ts: parse_utc(&reader.required_str("ts", row)?, "ts")?,
        asof_ts: parse_utc(&reader.required_str("asof_ts", row)?, "asof_ts")?,
        ts_provenance: TimestampProvenance::parse(&reader.required_str("ts_provenance", row)?)?,
        source,
        ingest_run_id: reader.required_str("ingest_run_id", row)?,
        quality_flags,
        trading_date_local,
        timezone_local: reader.optional_str("timezone_local", row)?,
        currency: reader.optional_str("currency", row)?,
        unit: reader.optional_str("unit", row)?,
    })
}

fn dataframe_to_bars(df: &DataFrame) -> Result<Vec<CanonicalRecord>> {
    let reader = ColumnReader { df };
    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let core = read_core(&reader, row)?;
        let bar = Bar {
            close: reader.required_f64("bar_close", row)?,
            open: reader.optional_f64("bar_open", row)?,
            high: reader.optional_f64("bar_high", row)?,
            low: reader.optional_f64("bar_low", row)?,
            volume: reader.optional_f64("bar_volume", row)?,
            adj_close: reader.optional_f64("bar_adj_close", row)?,
            adjustment_basis: reader
                .optional_str("bar_adjustment_basis", row)?
                .map(|raw| AdjustmentBasis::parse(&raw))
                .transpose()?,
            adjustment_note: reader.optional_str("bar_adjustment_note", row)?,
        };
        records.push(CanonicalRecord::bar(core, bar)?);
    }
    Ok(records)
}

fn dataframe_to_points(df: &DataFrame) -> Result<Vec<CanonicalRecord>> {
    let reader = ColumnReader { df };
    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let core = read_core(&reader, row)?;
        let point = PointObs {
            field: reader.required_str("field", row)?,
            value: reader.required_f64("value", row)?,
            base_ccy: reader.required_str("base_ccy", row)?,
            quote_ccy: reader.required_str("quote_ccy", row)?,
            fixing_convention: reader.optional_str("fixing_convention", row)?,
        };
        records.push(CanonicalRecord::point(core, point)?);
    }
    Ok(records)
}
