//! Market data cache service.
//!
//! `get_timeseries` is fingerprint-keyed: a manifest at
//! `manifests/<hash>.json` makes the request a cache hit and the provider
//! is never called. Hit or miss, the served table is always rebuilt by
//! reading the persisted partitions and re-running alignment and frame
//! validation — the manifest caches lineage and quality, not data — so
//! both paths produce identical results for the same fingerprint.

use crate::layout::{manifest_lock_path, manifest_path};
use crate::manifest::{manifest_exists, read_manifest, write_manifest};
use crate::market::{EodRow, ParquetMarketDataStore, WriteMeta};
use marketlab_core::error::{DataError, Result};
use marketlab_core::fingerprint::format_utc;
use marketlab_core::frame::{
    align_frame, combine_asset_series, validate_and_flag, AlignedFrame, AssetSeries,
};
use marketlab_core::lineage::{AssetMeta, LineageMeta, TimeSeriesBundle};
use marketlab_core::quality::QualityReport;
use marketlab_core::request::{request_hash, AssetId, CalendarSpec, FieldName, TimeSeriesRequest};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Daily end-of-day provider seam.
pub trait EodProvider {
    fn name(&self) -> &str;

    /// Rows per provider symbol for the window, fields included per row.
    fn fetch_eod(
        &self,
        provider_symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        fields: &[FieldName],
    ) -> Result<HashMap<String, Vec<EodRow>>>;
}

/// Session calendar seam, resolved per request calendar spec.
pub trait SessionCalendar {
    fn sessions(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate>;
}

/// Resolves a `CalendarSpec` to a session calendar.
pub trait CalendarFactory {
    fn calendar(&self, spec: &CalendarSpec) -> Result<Box<dyn SessionCalendar>>;
}

/// Asset id → provider symbol mapping; unmapped assets are request errors.
#[derive(Debug, Clone, Default)]
pub struct SymbolMapper {
    mapping: BTreeMap<AssetId, String>,
}

impl SymbolMapper {
    pub fn new(mapping: BTreeMap<AssetId, String>) -> Self {
        Self { mapping }
    }

    pub fn resolve(&self, asset: &AssetId) -> Result<&str> {
        self.mapping
            .get(asset)
            .map(String::as_str)
            .ok_or_else(|| {
                DataError::provider_request("asset has no provider symbol mapping")
                    .with("asset_id", asset.as_str())
            })
    }

    pub fn resolve_many(&self, assets: &[AssetId]) -> Result<BTreeMap<AssetId, String>> {
        assets
            .iter()
            .map(|asset| Ok((asset.clone(), self.resolve(asset)?.to_string())))
            .collect()
    }
}

/// Injected clock; tests pin it for reproducible lineage.
pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// How long a contender waits for another writer's manifest to appear.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);

pub struct MarketDataService {
    provider: Box<dyn EodProvider>,
    store: ParquetMarketDataStore,
    calendar_factory: Box<dyn CalendarFactory>,
    symbol_mapper: SymbolMapper,
    dataset_version: Option<String>,
    code_version: Option<String>,
    clock: Clock,
}

impl MarketDataService {
    pub fn new(
        provider: Box<dyn EodProvider>,
        store: ParquetMarketDataStore,
        calendar_factory: Box<dyn CalendarFactory>,
        symbol_mapper: SymbolMapper,
    ) -> Self {
        Self {
            provider,
            store,
            calendar_factory,
            symbol_mapper,
            dataset_version: None,
            code_version: None,
            clock: Box::new(Utc::now),
        }
    }

    pub fn with_dataset_version(mut self, version: impl Into<String>) -> Self {
        self.dataset_version = Some(version.into());
        self
    }

    pub fn with_code_version(mut self, version: impl Into<String>) -> Self {
        self.code_version = Some(version.into());
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Serve an aligned, validated bundle for the request, fetching from
    /// the provider only on a cache miss.
    pub fn get_timeseries(&self, request: &TimeSeriesRequest) -> Result<TimeSeriesBundle> {
        request.check()?;
        let req_hash = request_hash(request)?;
        let provider_name = self.provider.name().to_string();
        if provider_name.is_empty() {
            return Err(DataError::provider_request("provider name must be set"));
        }

        let root = self.store.root_path().to_path_buf();
        let lineage = if manifest_exists(&root, &req_hash)? {
            tracing::info!(request_hash = %req_hash, provider = %provider_name, "cache hit");
            let (lineage, _) = read_manifest(&root, &req_hash)?;
            lineage
        } else {
            self.populate_cache(request, &req_hash, &provider_name)?
        };

        self.serve_from_partitions(request, &req_hash, &provider_name, lineage)
    }

    /// Replay: rebuild a bundle from the manifest and stored partitions
    /// alone, without the original request object.
    pub fn get_timeseries_from_cache(&self, req_hash: &str) -> Result<TimeSeriesBundle> {
        let root = self.store.root_path().to_path_buf();
        let (lineage, _) = read_manifest(&root, req_hash)?;
        let request = TimeSeriesRequest::from_payload(&lineage.request_json)?;
        let recomputed = request_hash(&request)?;
        if recomputed != req_hash {
            return Err(DataError::storage("manifest request does not hash to its key")
                .with("request_hash", req_hash)
                .with("recomputed", recomputed));
        }
        let provider_name = lineage.provider.clone();
        self.serve_from_partitions(&request, req_hash, &provider_name, lineage)
    }

    /// Cache-miss path: fetch, persist partitions, validate once for the
    /// manifest, write the manifest. Guarded by a per-fingerprint lock so
    /// concurrent identical requests fetch at most once.
    fn populate_cache(
        &self,
        request: &TimeSeriesRequest,
        req_hash: &str,
        provider_name: &str,
    ) -> Result<LineageMeta> {
        let root = self.store.root_path().to_path_buf();
        let _lock = match FingerprintLock::acquire(&root, req_hash)? {
            Some(lock) => lock,
            None => {
                // Another writer is in flight; wait for its manifest.
                return wait_for_manifest(&root, req_hash);
            }
        };
        // The winner re-checks: the manifest may have landed between the
        // existence check and lock acquisition.
        if manifest_exists(&root, req_hash)? {
            let (lineage, _) = read_manifest(&root, req_hash)?;
            return Ok(lineage);
        }

        tracing::info!(request_hash = %req_hash, provider = %provider_name, "cache miss");
        let ingestion_ts = (self.clock)();
        let asset_symbols = self.symbol_mapper.resolve_many(&request.assets)?;
        let fields: Vec<FieldName> = request.fields.iter().copied().collect();

        let provider_symbols: Vec<String> = asset_symbols.values().cloned().collect();
        let mut fetched = self.provider.fetch_eod(
            &provider_symbols,
            request.start,
            request.end,
            &fields,
        )?;
        if fetched.values().all(|rows| rows.is_empty()) {
            return Err(DataError::provider_response("provider returned empty data")
                .with("request_hash", req_hash));
        }

        let mut storage_paths: Vec<PathBuf> = Vec::new();
        for (asset, symbol) in &asset_symbols {
            let rows = fetched.remove(symbol).ok_or_else(|| {
                DataError::provider_response("provider data missing symbol")
                    .with("asset_id", asset.as_str())
                    .with("provider_symbol", symbol.clone())
            })?;
            if rows.is_empty() {
                return Err(DataError::provider_response("provider returned empty data")
                    .with("asset_id", asset.as_str()));
            }
            require_fields(&rows, asset, &fields)?;
            let written = self.store.write_asset_frame(
                asset,
                &rows,
                &fields,
                &WriteMeta {
                    vendor_symbol: symbol.clone(),
                    ingestion_ts_utc: format_utc(ingestion_ts),
                    provider: provider_name.to_string(),
                },
            )?;
            storage_paths.extend(written);
        }

        // Validate what was actually persisted, not the provider response.
        let (_, quality, _) = self.rebuild(request, req_hash, provider_name)?;

        let lineage = self.build_lineage(request, req_hash, provider_name, ingestion_ts, &storage_paths)?;
        write_manifest(&root, req_hash, &lineage, &quality, &storage_paths)?;
        Ok(lineage)
    }

    /// Shared hit/miss/replay tail: read partitions, align, validate.
    fn serve_from_partitions(
        &self,
        request: &TimeSeriesRequest,
        req_hash: &str,
        provider_name: &str,
        lineage: LineageMeta,
    ) -> Result<TimeSeriesBundle> {
        let (aligned, quality, series) = self.rebuild(request, req_hash, provider_name)?;
        let asset_symbols = self.symbol_mapper.resolve_many(&request.assets).ok();

        let mut assets_meta = BTreeMap::new();
        for asset in &request.assets {
            let entry = &series[asset];
            let provider_symbol = asset_symbols
                .as_ref()
                .and_then(|map| map.get(asset).cloned())
                .or_else(|| entry.vendor_symbol.clone())
                .unwrap_or_default();
            assets_meta.insert(
                asset.clone(),
                AssetMeta {
                    provider: provider_name.to_string(),
                    provider_symbol,
                    vendor_symbol: entry.vendor_symbol.clone(),
                    ingestion_ts_utc: entry.ingestion_ts_utc.clone(),
                },
            );
        }

        Ok(TimeSeriesBundle {
            data: aligned,
            assets_meta,
            quality,
            lineage,
        })
    }

    fn rebuild(
        &self,
        request: &TimeSeriesRequest,
        req_hash: &str,
        provider_name: &str,
    ) -> Result<(AlignedFrame, QualityReport, HashMap<AssetId, AssetSeries>)> {
        let fields: Vec<FieldName> = request.fields.iter().copied().collect();
        let series = self.store.read_assets(
            &request.assets,
            request.start,
            request.end,
            &fields,
            provider_name,
        )?;
        let combined = combine_asset_series(&series, &request.assets, &fields)?;
        let target_index = self.build_target_index(request)?;
        let aligned = align_frame(&combined, &target_index, &request.missing)?;
        let (validated, quality) = validate_and_flag(&aligned, &request.validate)
            .map_err(|e| e.with("request_hash", req_hash.to_string()))?;
        Ok((validated, quality, series))
    }

    fn build_target_index(&self, request: &TimeSeriesRequest) -> Result<Vec<NaiveDate>> {
        let calendar = self.calendar_factory.calendar(&request.calendar)?;
        let sessions = calendar.sessions(request.start, request.end);
        let mut unique = sessions.clone();
        unique.dedup();
        if unique.len() != sessions.len() {
            return Err(DataError::validation("target calendar sessions must be unique")
                .with("market", request.calendar.market.clone()));
        }
        if !sessions.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(DataError::validation(
                "target calendar sessions must be monotonic increasing",
            )
            .with("market", request.calendar.market.clone()));
        }
        Ok(sessions)
    }

    fn build_lineage(
        &self,
        request: &TimeSeriesRequest,
        req_hash: &str,
        provider_name: &str,
        ingestion_ts: DateTime<Utc>,
        storage_paths: &[PathBuf],
    ) -> Result<LineageMeta> {
        let dataset_version = match &self.dataset_version {
            Some(version) => version.clone(),
            None => match request.as_of {
                Some(as_of) => as_of.date_naive().to_string(),
                None => ingestion_ts.date_naive().to_string(),
            },
        };
        let mut normalized: Vec<String> = storage_paths
            .iter()
            .map(|path| path.display().to_string().replace('\\', "/"))
            .collect();
        normalized.sort();

        let lineage = LineageMeta {
            request_hash: req_hash.to_string(),
            request_json: request.to_payload()?,
            provider: provider_name.to_string(),
            ingestion_ts_utc: format_utc(ingestion_ts),
            as_of_utc: request.as_of.map(format_utc),
            dataset_version,
            code_version: self.code_version.clone(),
            storage_paths: normalized,
        };
        lineage.validate()?;
        Ok(lineage)
    }
}

fn require_fields(rows: &[EodRow], asset: &AssetId, fields: &[FieldName]) -> Result<()> {
    for field in fields {
        if rows.iter().all(|row| !row.values.contains_key(field)) {
            return Err(DataError::provider_response("provider data missing requested fields")
                .with("asset_id", asset.as_str())
                .with("field", field.as_str()));
        }
    }
    Ok(())
}

/// Exclusive per-fingerprint writer lock backed by a lock file created
/// with `create_new`. Removed on drop.
struct FingerprintLock {
    path: PathBuf,
}

impl FingerprintLock {
    /// `Ok(Some)` when this process is the single writer, `Ok(None)` when
    /// another writer holds the lock.
    fn acquire(root: &Path, request_hash: &str) -> Result<Option<Self>> {
        let path = manifest_lock_path(root, request_hash)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DataError::storage("failed to create manifests dir")
                    .with("path", parent.display().to_string())
                    .with_cause(e)
            })?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(DataError::storage("failed to acquire fingerprint lock")
                .with("path", path.display().to_string())
                .with_cause(e)),
        }
    }
}

impl Drop for FingerprintLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Block until the in-flight writer's manifest appears, then serve it as
/// a hit; a stale lock surfaces as a storage error after the wait budget.
fn wait_for_manifest(root: &Path, request_hash: &str) -> Result<LineageMeta> {
    let deadline = Instant::now() + LOCK_WAIT;
    loop {
        if manifest_exists(root, request_hash)? {
            tracing::info!(request_hash = %request_hash, "cache hit after waiting for writer");
            let (lineage, _) = read_manifest(root, request_hash)?;
            return Ok(lineage);
        }
        if Instant::now() >= deadline {
            return Err(DataError::storage("timed out waiting for in-flight fetch")
                .with("request_hash", request_hash)
                .with(
                    "lock_path",
                    manifest_lock_path(root, request_hash)?.display().to_string(),
                )
                .with(
                    "manifest_path",
                    manifest_path(root, request_hash)?.display().to_string(),
                ));
        }
        std::thread::sleep(LOCK_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_mapper_rejects_unmapped_assets() {
        let mapper = SymbolMapper::new(BTreeMap::from([(AssetId::new("EQ:SPY"), "SPY".into())]));
        assert!(mapper.resolve(&AssetId::new("EQ:SPY")).is_ok());
        assert!(mapper.resolve(&AssetId::new("EQ:QQQ")).is_err());
    }

    #[test]
    fn fingerprint_lock_is_exclusive() {
        let root = std::env::temp_dir().join(format!("marketlab_lock_{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();

        let first = FingerprintLock::acquire(&root, "hash-1").unwrap();
        assert!(first.is_some());
        let second = FingerprintLock::acquire(&root, "hash-1").unwrap();
        assert!(second.is_none());

        drop(first);
        let third = FingerprintLock::acquire(&root, "hash-1").unwrap();
        assert!(third.is_some());

        let _ = fs::remove_dir_all(&root);
    }
}
