//! Cache service behavior: miss-then-hit with a single provider call,
//! byte-identical quality/lineage across paths, and replay by hash.

use chrono::{NaiveDate, TimeZone, Utc};
use marketlab_core::frame::AlignedFrame;
use marketlab_core::quality::FrameFlag;
use marketlab_core::request::{
    request_hash, AssetId, CalendarSpec, FieldName, TimeSeriesRequest,
};
use marketlab_store::market::{EodRow, ParquetMarketDataStore};
use marketlab_store::service::{
    CalendarFactory, EodProvider, MarketDataService, SessionCalendar, SymbolMapper,
};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_root(tag: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = env::temp_dir().join(format!("marketlab_svc_{tag}_{}_{id}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn row(d: &str, close: f64) -> EodRow {
    EodRow {
        date: date(d),
        values: BTreeMap::from([(FieldName::Close, close)]),
    }
}

/// Fixed-response provider that counts calls.
struct StubProvider {
    rows: HashMap<String, Vec<EodRow>>,
    calls: Arc<AtomicUsize>,
}

impl EodProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn fetch_eod(
        &self,
        provider_symbols: &[String],
        _start: NaiveDate,
        _end: NaiveDate,
        _fields: &[FieldName],
    ) -> marketlab_core::Result<HashMap<String, Vec<EodRow>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(provider_symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.rows.get(symbol).cloned().unwrap_or_default()))
            .collect())
    }
}

struct StaticCalendar {
    sessions: Vec<NaiveDate>,
}

impl SessionCalendar for StaticCalendar {
    fn sessions(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.sessions
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect()
    }
}

struct StaticCalendarFactory {
    sessions: Vec<NaiveDate>,
}

impl CalendarFactory for StaticCalendarFactory {
    fn calendar(
        &self,
        _spec: &CalendarSpec,
    ) -> marketlab_core::Result<Box<dyn SessionCalendar>> {
        Ok(Box::new(StaticCalendar {
            sessions: self.sessions.clone(),
        }))
    }
}

fn sessions() -> Vec<NaiveDate> {
    vec![date("2024-01-02"), date("2024-01-03")]
}

fn service(root: &PathBuf, calls: Arc<AtomicUsize>) -> MarketDataService {
    let provider = StubProvider {
        rows: HashMap::from([
            (
                "SPY".to_string(),
                vec![row("2024-01-02", 100.0), row("2024-01-03", 101.0)],
            ),
            (
                "QQQ".to_string(),
                vec![row("2024-01-02", 200.0), row("2024-01-03", 201.0)],
            ),
        ]),
        calls,
    };
    let mapper = SymbolMapper::new(BTreeMap::from([
        (AssetId::new("EQ:SPY"), "SPY".to_string()),
        (AssetId::new("EQ:QQQ"), "QQQ".to_string()),
    ]));
    MarketDataService::new(
        Box::new(provider),
        ParquetMarketDataStore::new(root.clone()),
        Box::new(StaticCalendarFactory { sessions: sessions() }),
        mapper,
    )
    .with_dataset_version("2024-01-03")
    .with_clock(Box::new(|| Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap()))
}

fn sample_request() -> TimeSeriesRequest {
    TimeSeriesRequest::daily(
        vec![AssetId::new("EQ:SPY"), AssetId::new("EQ:QQQ")],
        date("2024-01-02"),
        date("2024-01-03"),
        CalendarSpec::market("XNYS").unwrap(),
    )
    .unwrap()
}

#[test]
fn miss_then_hit_calls_provider_once_and_reproduces_results() {
    let root = temp_root("hit");
    let calls = Arc::new(AtomicUsize::new(0));
    let service = service(&root, calls.clone());
    let request = sample_request();

    let first = service.get_timeseries(&request).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = service.get_timeseries(&request).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second call must be a cache hit");

    // Bit-identical quality and lineage payloads on both paths.
    assert_eq!(
        serde_json::to_string(&first.quality).unwrap(),
        serde_json::to_string(&second.quality).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.lineage).unwrap(),
        serde_json::to_string(&second.lineage).unwrap()
    );
    assert!(first.data == second.data);

    // Served table is aligned to the calendar sessions.
    assert_eq!(first.data.dates(), sessions().as_slice());
    let spy_close = first
        .data
        .column(&AssetId::new("EQ:SPY"), FieldName::Close)
        .unwrap();
    assert_eq!(spy_close, &[100.0, 101.0]);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn permuted_request_is_the_same_cache_entry() {
    let root = temp_root("permuted");
    let calls = Arc::new(AtomicUsize::new(0));
    let service = service(&root, calls.clone());

    let request = sample_request();
    service.get_timeseries(&request).unwrap();

    let mut permuted = sample_request();
    permuted.assets.reverse();
    service.get_timeseries(&permuted).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn replay_by_hash_skips_the_provider() {
    let root = temp_root("replay");
    let calls = Arc::new(AtomicUsize::new(0));
    let service = service(&root, calls.clone());
    let request = sample_request();

    let bundle = service.get_timeseries(&request).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let replayed = service
        .get_timeseries_from_cache(&bundle.lineage.request_hash)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(replayed.lineage.request_hash, bundle.lineage.request_hash);
    assert_eq!(replayed.data.dates(), sessions().as_slice());
    assert_eq!(
        serde_json::to_string(&replayed.quality).unwrap(),
        serde_json::to_string(&bundle.quality).unwrap()
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn replay_of_unknown_hash_is_an_error() {
    let root = temp_root("nohash");
    let service = service(&root, Arc::new(AtomicUsize::new(0)));
    assert!(service.get_timeseries_from_cache("does-not-exist").is_err());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_dates_are_flagged_with_coverage() {
    let root = temp_root("missing");
    let calls = Arc::new(AtomicUsize::new(0));

    // QQQ misses 2024-01-03.
    let provider = StubProvider {
        rows: HashMap::from([
            (
                "SPY".to_string(),
                vec![row("2024-01-02", 100.0), row("2024-01-03", 101.0)],
            ),
            ("QQQ".to_string(), vec![row("2024-01-02", 200.0)]),
        ]),
        calls: calls.clone(),
    };
    let mapper = SymbolMapper::new(BTreeMap::from([
        (AssetId::new("EQ:SPY"), "SPY".to_string()),
        (AssetId::new("EQ:QQQ"), "QQQ".to_string()),
    ]));
    let service = MarketDataService::new(
        Box::new(provider),
        ParquetMarketDataStore::new(root.clone()),
        Box::new(StaticCalendarFactory { sessions: sessions() }),
        mapper,
    )
    .with_clock(Box::new(|| Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap()));

    let bundle = service.get_timeseries(&sample_request()).unwrap();
    let qqq = AssetId::new("EQ:QQQ");
    assert_eq!(bundle.quality.coverage[&qqq], 0.5);
    assert_eq!(bundle.quality.flag_counts[&qqq][&FrameFlag::Missing], 1);
    assert_eq!(
        bundle.quality.flag_examples[&qqq][&FrameFlag::Missing],
        vec!["2024-01-03".to_string()]
    );
    assert_eq!(bundle.quality.coverage[&AssetId::new("EQ:SPY")], 1.0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn manifest_lands_at_the_request_hash_path() {
    let root = temp_root("layout");
    let service = service(&root, Arc::new(AtomicUsize::new(0)));
    let request = sample_request();

    service.get_timeseries(&request).unwrap();
    let hash = request_hash(&request).unwrap();
    assert!(root.join("manifests").join(format!("{hash}.json")).exists());
    assert!(root
        .join("market")
        .join("stub")
        .join("EQ_SPY")
        .join("1D")
        .join("part-2024.parquet")
        .exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unmapped_asset_is_a_provider_request_error() {
    let root = temp_root("unmapped");
    let calls = Arc::new(AtomicUsize::new(0));
    let service = service(&root, calls.clone());

    let mut request = sample_request();
    request.assets.push(AssetId::new("EQ:IWM"));
    let err = service.get_timeseries(&request).unwrap_err();
    assert!(err.is_kind(marketlab_core::ErrorKind::ProviderRequest));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let _ = fs::remove_dir_all(&root);
}

/// The bundle's frame equality is NaN-aware; sanity-check the helper here
/// so service assertions can rely on `==`.
#[test]
fn aligned_frame_equality_is_nan_aware() {
    let asset = AssetId::new("EQ:SPY");
    let mut columns = HashMap::new();
    columns.insert((asset.clone(), FieldName::Close), vec![f64::NAN, 1.0]);
    let a = AlignedFrame::new(
        vec![date("2024-01-02"), date("2024-01-03")],
        vec![asset.clone()],
        vec![FieldName::Close],
        columns.clone(),
    )
    .unwrap();
    let b = AlignedFrame::new(
        vec![date("2024-01-02"), date("2024-01-03")],
        vec![asset],
        vec![FieldName::Close],
        columns,
    )
    .unwrap();
    assert!(a == b);
}
