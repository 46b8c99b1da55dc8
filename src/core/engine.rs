//! One refresh cycle: cached lookups, alignment, derivation and degrade handling.

use crate::core::align::{AlignedFrame, Bucketing, Cell, SeriesAligner, Track};
use crate::core::cache::{FetchFailed, TtlCache};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::AppConfig;
use crate::core::derive::{Conversion, Delta, DerivedRow, PriceDeriver, latest_delta};
use crate::core::quote::{FetchRequest, Quantity, Quote, Series, SourceId};
use crate::core::fallback::FallbackResolver;
use crate::core::source::{AllSourcesFailed, Resolved};
use crate::providers::SourceRegistry;
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Asia::Seoul;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A displayed value with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    /// Sources whose data produced the value, in input order.
    pub sources: Vec<SourceId>,
    /// Served from a value older than the staleness threshold, or from the last
    /// good value after every source failed.
    pub stale: bool,
    /// Change against the previous period.
    pub delta: Option<Delta>,
}

/// One priced metal: spot in its native unit, its per-don KRW price and the
/// derived daily history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetalBoard {
    pub spot: Option<Reading>,
    pub per_don_krw: Option<Reading>,
    pub history: Vec<DerivedRow>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxBoard {
    pub rate: Option<Reading>,
    pub issues: Vec<String>,
}

/// Everything the display layer needs for one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub gold: MetalBoard,
    pub silver: MetalBoard,
    pub domestic_gold: MetalBoard,
    pub fx: FxBoard,
    /// Newest fetch time among the inputs. Unchanged by cache hits.
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// A lookup that produced data, possibly degraded.
struct Input {
    resolved: Arc<Resolved>,
    fetched_at: DateTime<Utc>,
    stale: bool,
}

impl Input {
    fn quote(&self) -> Option<&Quote> {
        self.resolved.data.as_quote()
    }

    fn series(&self) -> Option<&Series> {
        self.resolved.data.as_series()
    }
}

#[derive(Default)]
struct Inputs {
    found: HashMap<FetchRequest, Input>,
    issues: HashMap<Quantity, Vec<String>>,
}

impl Inputs {
    fn get(&self, request: FetchRequest) -> Option<&Input> {
        self.found.get(&request)
    }

    fn issues(&self, quantity: Quantity) -> Vec<String> {
        self.issues.get(&quantity).cloned().unwrap_or_default()
    }

    fn note(&mut self, quantity: Quantity, issue: String) {
        self.issues.entry(quantity).or_default().push(issue);
    }

    fn track(&self, quantity: Quantity) -> Track<'_> {
        Track {
            symbol: quantity,
            history: self
                .get(FetchRequest::history(quantity))
                .and_then(Input::series),
            live: self.get(FetchRequest::live(quantity)).and_then(Input::quote),
        }
    }

    /// The lookup a frame cell was taken from: the live quote when it was
    /// overlaid, otherwise the history.
    fn origin(&self, quantity: Quantity, cell: &Cell) -> Option<&Input> {
        let live = self.get(FetchRequest::live(quantity));
        let history = self.get(FetchRequest::history(quantity));
        match live {
            Some(input)
                if input
                    .quote()
                    .is_some_and(|q| q.observed_at == cell.observed_at) =>
            {
                Some(input)
            }
            _ => history.or(live),
        }
    }

    fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.found.values().map(|input| input.fetched_at).max()
    }
}

pub struct PriceEngine {
    config: AppConfig,
    registry: SourceRegistry,
    resolver: FallbackResolver,
    cache: TtlCache<FetchRequest, Resolved, AllSourcesFailed>,
    aligner: SeriesAligner,
    deriver: PriceDeriver,
    clock: Arc<dyn Clock>,
}

impl PriceEngine {
    pub fn new(config: AppConfig, registry: SourceRegistry, clock: Arc<dyn Clock>) -> Self {
        for request in all_requests() {
            for id in config.preferred_sources(request) {
                match registry.get(*id) {
                    None => debug!("Source {} listed for {} is not available", id, request),
                    Some(source) if !source.supports(&request) => {
                        warn!("Source {} listed for {} cannot serve it", id, request)
                    }
                    Some(_) => {}
                }
            }
        }
        Self {
            resolver: FallbackResolver::new(config.timeout()),
            cache: TtlCache::new(Arc::clone(&clock), config.negative_ttl()),
            aligner: SeriesAligner::new(Bucketing::Daily(Seoul)),
            deriver: PriceDeriver::new(config.units),
            registry,
            config,
            clock,
        }
    }

    /// Engine over the real upstream adapters and the system clock.
    pub fn from_config(config: AppConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = SourceRegistry::from_config(&config, Arc::clone(&clock));
        Self::new(config, registry, clock)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs every lookup concurrently and assembles a snapshot. Never fails;
    /// missing inputs only blank the readings that need them.
    #[instrument(name = "refresh", skip(self))]
    pub async fn refresh(&self) -> Snapshot {
        let requests = all_requests();
        let outcomes = join_all(requests.iter().map(|request| self.lookup(*request))).await;

        let mut inputs = Inputs::default();
        for (request, outcome) in requests.into_iter().zip(outcomes) {
            match outcome {
                Ok((input, degraded)) => {
                    if let Some(issue) = degraded {
                        inputs.note(request.quantity, issue);
                    }
                    inputs.found.insert(request, input);
                }
                Err(issue) => inputs.note(request.quantity, issue),
            }
        }

        let fx = Quantity::UsdKrw;
        let snapshot = Snapshot {
            gold: self.metal(&inputs, Quantity::GoldUsd, Conversion::UsdPerOunce { fx }),
            silver: self.metal(&inputs, Quantity::SilverUsd, Conversion::UsdPerOunce { fx }),
            domestic_gold: self.metal(&inputs, Quantity::DomesticGold, Conversion::KrwPerGram),
            fx: FxBoard {
                rate: self.spot_reading(&inputs, fx),
                issues: inputs.issues(fx),
            },
            last_updated_at: inputs.last_updated_at(),
        };
        info!(
            "Refreshed snapshot, last updated {:?}",
            snapshot.last_updated_at
        );
        snapshot
    }

    /// Expires every cached entry, keeping last good values, and refreshes.
    pub async fn force_refresh(&self) -> Snapshot {
        self.cache.clear().await;
        self.refresh().await
    }

    /// Cached resolution of one request. `Ok` carries an issue when the value
    /// is the last good one served after a failure; `Err` is the section issue.
    async fn lookup(&self, request: FetchRequest) -> Result<(Input, Option<String>), String> {
        let sources = self
            .registry
            .sources_for(request, self.config.preferred_sources(request));
        let outcome = self
            .cache
            .get_or_fetch(request, self.config.ttl(request), || {
                self.resolver.resolve(request, &sources)
            })
            .await;

        let threshold = TimeDelta::from_std(self.config.staleness_threshold(request.kind))
            .unwrap_or(TimeDelta::MAX);
        let now = self.clock.now();

        match outcome {
            Ok(stamped) => Ok((
                Input {
                    stale: now - stamped.fetched_at > threshold,
                    resolved: stamped.value,
                    fetched_at: stamped.fetched_at,
                },
                None,
            )),
            Err(FetchFailed {
                error,
                last_good: Some(stamped),
            }) => {
                warn!("Serving last good value for {}: {}", request, error);
                Ok((
                    Input {
                        stale: true,
                        resolved: stamped.value,
                        fetched_at: stamped.fetched_at,
                    },
                    Some(format!("{error}; showing last good value")),
                ))
            }
            Err(FetchFailed {
                error,
                last_good: None,
            }) => Err(error.to_string()),
        }
    }

    fn spot_reading(&self, inputs: &Inputs, quantity: Quantity) -> Option<Reading> {
        let frame = self.aligner.align(&[inputs.track(quantity)]);
        let row = frame.last()?;
        let cell = frame.cell(row, quantity)?;
        let origin = inputs.origin(quantity, &cell);
        Some(Reading {
            value: cell.value,
            observed_at: cell.observed_at,
            sources: origin.map(|i| vec![i.resolved.source]).unwrap_or_default(),
            stale: origin.is_some_and(|i| i.stale),
            delta: latest_delta(&column(&frame, quantity)),
        })
    }

    fn metal(&self, inputs: &Inputs, spot: Quantity, conversion: Conversion) -> MetalBoard {
        let mut issues = inputs.issues(spot);
        let spot_reading = self.spot_reading(inputs, spot);

        let mut tracks = vec![inputs.track(spot)];
        if let Conversion::UsdPerOunce { fx } = conversion {
            tracks.push(inputs.track(fx));
        }
        let frame = self.aligner.align(&tracks);
        let history = self.deriver.derive(&frame, spot, conversion);

        let per_don_krw = frame.last().zip(history.last()).map(|(row, derived)| {
            let origins: Vec<&Input> = tracks
                .iter()
                .filter_map(|track| {
                    let cell = frame.cell(row, track.symbol)?;
                    inputs.origin(track.symbol, &cell)
                })
                .collect();
            let mut sources: Vec<SourceId> = Vec::new();
            for input in &origins {
                if !sources.contains(&input.resolved.source) {
                    sources.push(input.resolved.source);
                }
            }
            let values: Vec<f64> = history.iter().map(|d| d.don_price_krw).collect();
            Reading {
                value: derived.don_price_krw,
                observed_at: derived.observed_at,
                sources,
                stale: origins.iter().any(|i| i.stale),
                delta: latest_delta(&values),
            }
        });

        if spot_reading.is_none() {
            issues.push(format!("no {spot} data available"));
        } else if per_don_krw.is_none() {
            if let Conversion::UsdPerOunce { fx } = conversion {
                issues.push(format!("KRW price withheld: {fx} unavailable"));
            }
        }

        MetalBoard {
            spot: spot_reading,
            per_don_krw,
            history,
            issues,
        }
    }
}

fn all_requests() -> Vec<FetchRequest> {
    Quantity::ALL
        .iter()
        .flat_map(|q| [FetchRequest::live(*q), FetchRequest::history(*q)])
        .collect()
}

fn column(frame: &AlignedFrame, quantity: Quantity) -> Vec<f64> {
    frame
        .rows
        .iter()
        .filter_map(|row| frame.cell(row, quantity).map(|cell| cell.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::derive::Direction;
    use crate::core::quote::Fetched;
    use crate::core::source::{FetchError, SourceClient};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned data per request and counts upstream calls.
    struct TableSource {
        id: SourceId,
        table: Mutex<HashMap<FetchRequest, Result<Fetched, FetchError>>>,
        calls: AtomicUsize,
    }

    impl TableSource {
        fn new(id: SourceId) -> Arc<Self> {
            Arc::new(Self {
                id,
                table: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, request: FetchRequest, outcome: Result<Fetched, FetchError>) {
            self.table.lock().unwrap().insert(request, outcome);
        }

        fn fail_all(&self, error: FetchError) {
            let mut table = self.table.lock().unwrap();
            for outcome in table.values_mut() {
                *outcome = Err(error.clone());
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceClient for TableSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn supports(&self, _request: &FetchRequest) -> bool {
            true
        }

        async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.table
                .lock()
                .unwrap()
                .get(request)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::Empty(format!("nothing for {request}"))))
        }
    }

    fn now() -> DateTime<Utc> {
        // Noon in Seoul on 2024-01-03.
        Utc.with_ymd_and_hms(2024, 1, 3, 3, 0, 0).unwrap()
    }

    fn seoul_midnight(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap() - TimeDelta::hours(9)
    }

    fn history(source: SourceId, quantity: Quantity, values: [f64; 2]) -> Result<Fetched, FetchError> {
        Ok(Fetched::Series(Series::from_points(
            quantity,
            source,
            [(seoul_midnight(1), values[0]), (seoul_midnight(2), values[1])],
        )))
    }

    fn live(source: SourceId, quantity: Quantity, value: f64) -> Result<Fetched, FetchError> {
        Ok(Fetched::Point(Quote {
            symbol: quantity,
            value,
            observed_at: now() - TimeDelta::minutes(1),
            source,
        }))
    }

    struct Fixture {
        engine: PriceEngine,
        clock: Arc<ManualClock>,
        yahoo: Arc<TableSource>,
        fx: Arc<TableSource>,
        krx: Arc<TableSource>,
    }

    fn fixture(config: AppConfig) -> Fixture {
        let yahoo = TableSource::new(SourceId::Yahoo);
        yahoo.set(
            FetchRequest::history(Quantity::GoldUsd),
            history(SourceId::Yahoo, Quantity::GoldUsd, [1990.0, 1995.0]),
        );
        yahoo.set(
            FetchRequest::live(Quantity::GoldUsd),
            live(SourceId::Yahoo, Quantity::GoldUsd, 2000.0),
        );
        yahoo.set(
            FetchRequest::history(Quantity::SilverUsd),
            history(SourceId::Yahoo, Quantity::SilverUsd, [23.0, 23.0]),
        );
        yahoo.set(
            FetchRequest::live(Quantity::SilverUsd),
            live(SourceId::Yahoo, Quantity::SilverUsd, 23.0),
        );

        let fx = TableSource::new(SourceId::NaverFx);
        fx.set(
            FetchRequest::history(Quantity::UsdKrw),
            history(SourceId::NaverFx, Quantity::UsdKrw, [1290.0, 1295.0]),
        );
        fx.set(
            FetchRequest::live(Quantity::UsdKrw),
            live(SourceId::NaverFx, Quantity::UsdKrw, 1300.0),
        );

        let krx = TableSource::new(SourceId::Krx);
        krx.set(
            FetchRequest::history(Quantity::DomesticGold),
            history(SourceId::Krx, Quantity::DomesticGold, [85000.0, 86000.0]),
        );
        krx.set(
            FetchRequest::live(Quantity::DomesticGold),
            live(SourceId::Krx, Quantity::DomesticGold, 86500.0),
        );

        let mut registry = SourceRegistry::new();
        registry.register(yahoo.clone());
        registry.register(fx.clone());
        registry.register(krx.clone());

        let clock = Arc::new(ManualClock::new(now()));
        let engine = PriceEngine::new(config, registry, clock.clone());
        Fixture {
            engine,
            clock,
            yahoo,
            fx,
            krx,
        }
    }

    #[tokio::test]
    async fn test_gold_per_don_from_spot_and_fx() {
        let f = fixture(AppConfig::default());
        let snapshot = f.engine.refresh().await;

        let spot = snapshot.gold.spot.unwrap();
        assert_eq!(spot.value, 2000.0);
        assert_eq!(spot.sources, vec![SourceId::Yahoo]);
        assert!(!spot.stale);
        let delta = spot.delta.unwrap();
        assert_eq!(delta.change, 5.0);
        assert_eq!(delta.direction, Direction::Up);

        let per_don = snapshot.gold.per_don_krw.unwrap();
        assert_eq!(per_don.value.round(), 313_470.0);
        assert_eq!(per_don.sources, vec![SourceId::Yahoo, SourceId::NaverFx]);
        assert_eq!(snapshot.gold.history.len(), 3);
        assert!(snapshot.gold.issues.is_empty());

        let silver = snapshot.silver.spot.unwrap();
        assert_eq!(silver.delta.unwrap().direction, Direction::Unchanged);

        let domestic = snapshot.domestic_gold.per_don_krw.unwrap();
        assert_eq!(domestic.value, 86500.0 * 3.75);
        assert_eq!(domestic.sources, vec![SourceId::Krx]);

        assert_eq!(snapshot.fx.rate.unwrap().value, 1300.0);
        assert_eq!(snapshot.last_updated_at, Some(now()));
    }

    #[tokio::test]
    async fn test_refresh_within_ttl_is_idempotent() {
        let f = fixture(AppConfig::default());
        let first = serde_json::to_string(&f.engine.refresh().await).unwrap();
        f.clock.advance(TimeDelta::seconds(30));
        let second = serde_json::to_string(&f.engine.refresh().await).unwrap();

        assert_eq!(first, second);
        assert_eq!(f.yahoo.calls(), 4);
        assert_eq!(f.fx.calls(), 2);
        assert_eq!(f.krx.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_refetches_everything() {
        let f = fixture(AppConfig::default());
        f.engine.refresh().await;
        let snapshot = f.engine.force_refresh().await;

        assert_eq!(f.yahoo.calls(), 8);
        assert_eq!(f.krx.calls(), 4);
        assert!(snapshot.gold.per_don_krw.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_fetches() {
        let f = fixture(AppConfig::default());
        let (a, b) = tokio::join!(f.engine.refresh(), f.engine.refresh());
        assert_eq!(a, b);
        assert_eq!(f.yahoo.calls(), 4);
        assert_eq!(f.fx.calls(), 2);
    }

    #[tokio::test]
    async fn test_fx_failure_withholds_only_krw_prices() {
        let f = fixture(AppConfig::default());
        f.fx.fail_all(FetchError::Unparseable("chart markup changed".to_string()));
        let snapshot = f.engine.refresh().await;

        assert_eq!(snapshot.gold.spot.unwrap().value, 2000.0);
        assert!(snapshot.gold.per_don_krw.is_none());
        assert!(
            snapshot
                .gold
                .issues
                .iter()
                .any(|issue| issue.contains("withheld"))
        );
        assert!(snapshot.silver.spot.is_some());
        assert!(snapshot.silver.per_don_krw.is_none());

        assert!(snapshot.fx.rate.is_none());
        assert!(
            snapshot
                .fx
                .issues
                .iter()
                .any(|issue| issue.contains("chart markup changed"))
        );

        let domestic = snapshot.domestic_gold.per_don_krw.unwrap();
        assert_eq!(domestic.value, 86500.0 * 3.75);
        assert!(!domestic.stale);
        assert!(snapshot.domestic_gold.issues.is_empty());
    }

    #[tokio::test]
    async fn test_domestic_failure_is_isolated() {
        let f = fixture(AppConfig::default());
        f.krx.fail_all(FetchError::Unreachable("connection refused".to_string()));
        let snapshot = f.engine.refresh().await;

        assert!(snapshot.domestic_gold.spot.is_none());
        assert!(snapshot.domestic_gold.per_don_krw.is_none());
        assert!(snapshot.domestic_gold.history.is_empty());
        assert!(!snapshot.domestic_gold.issues.is_empty());
        assert!(snapshot.gold.per_don_krw.is_some());
        assert!(snapshot.fx.rate.is_some());
    }

    #[tokio::test]
    async fn test_unbounded_cache_durations_do_not_panic() {
        let mut config = AppConfig::default();
        config.cache.negative_ttl_secs = u64::MAX;
        config.cache.ttl.gold_usd.live = u64::MAX;
        let f = fixture(config);
        f.fx.fail_all(FetchError::Unreachable("503".to_string()));

        let first = f.engine.refresh().await;
        assert!(first.fx.rate.is_none());
        assert_eq!(first.gold.spot.unwrap().value, 2000.0);

        f.clock.advance(TimeDelta::days(3650));
        let second = f.engine.refresh().await;
        assert!(second.fx.rate.is_none());
        // Both the failure and the gold quote are still cached.
        assert_eq!(f.fx.calls(), 2);
        assert_eq!(second.gold.spot.unwrap().value, 2000.0);
    }

    fn hourly_domestic_ttl() -> AppConfig {
        let mut config = AppConfig::default();
        config.cache.ttl.domestic_gold.live = 60 * 60;
        config.cache.ttl.domestic_gold.history = 60 * 60;
        config
    }

    #[tokio::test]
    async fn test_cached_value_past_staleness_threshold_is_flagged() {
        let f = fixture(hourly_domestic_ttl());
        f.engine.refresh().await;

        f.krx.fail_all(FetchError::Unreachable("down".to_string()));
        f.clock.advance(TimeDelta::minutes(50));
        let snapshot = f.engine.refresh().await;

        let per_don = snapshot.domestic_gold.per_don_krw.unwrap();
        assert_eq!(per_don.value, 86500.0 * 3.75);
        assert!(per_don.stale);
        assert!(snapshot.domestic_gold.spot.unwrap().stale);
        // Still inside the TTL: no refetch.
        assert_eq!(f.krx.calls(), 2);
    }

    #[tokio::test]
    async fn test_last_good_value_served_when_all_sources_fail() {
        let f = fixture(hourly_domestic_ttl());
        f.engine.refresh().await;

        f.krx.fail_all(FetchError::Unreachable("down".to_string()));
        f.clock.advance(TimeDelta::minutes(65));
        let snapshot = f.engine.refresh().await;

        let per_don = snapshot.domestic_gold.per_don_krw.unwrap();
        assert_eq!(per_don.value, 86500.0 * 3.75);
        assert!(per_don.stale);
        assert!(
            snapshot
                .domestic_gold
                .issues
                .iter()
                .any(|issue| issue.contains("last good value"))
        );
        assert_eq!(f.krx.calls(), 4);
        assert_eq!(snapshot.last_updated_at, Some(now() + TimeDelta::minutes(65)));
    }

    #[tokio::test]
    async fn test_preference_falls_through_to_next_source() {
        let mut config = AppConfig::default();
        config.sources.gold_usd.live = vec![SourceId::NaverWorld, SourceId::Yahoo];
        let f = fixture(config);
        let world = TableSource::new(SourceId::NaverWorld);
        world.set(
            FetchRequest::live(Quantity::GoldUsd),
            Err(FetchError::Empty("no rows".to_string())),
        );
        let mut registry = SourceRegistry::new();
        registry.register(world.clone());
        registry.register(f.yahoo.clone());
        registry.register(f.fx.clone());
        let engine = PriceEngine::new(f.engine.config().clone(), registry, f.clock.clone());

        let snapshot = engine.refresh().await;
        assert_eq!(snapshot.gold.spot.unwrap().sources, vec![SourceId::Yahoo]);
        // Gold live plus the gold and silver histories list it first.
        assert_eq!(world.calls(), 3);
    }
}
