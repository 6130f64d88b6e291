//! Aggregator behaviour against fault-injected in-memory sources.

use async_trait::async_trait;
use breathe_core::{
    AqiCategory, Backoff, CacheKey, Config, DataSource, Error, ForecastAggregator,
    ForecastStatus, Freshness, Location, Pollutant, PollutantReading, ReadingCache, RetryPolicy,
    SourceError, SourceId,
    model::{Reading, TimeWindow, UnavailableReason},
};
use chrono::Utc;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

#[derive(Debug)]
enum Behavior {
    Readings(Vec<(Pollutant, f64)>),
    /// Fail with a retryable error on every attempt.
    Down,
    /// Fail with a non-retryable error.
    Rejects,
    /// Never answer.
    Hang,
    /// Fail `n` times, then answer.
    Flaky(usize, Vec<(Pollutant, f64)>),
}

#[derive(Debug)]
struct FakeSource {
    id: SourceId,
    pollutants: &'static [Pollutant],
    behavior: Behavior,
    policy: RetryPolicy,
    calls: AtomicUsize,
}

impl FakeSource {
    fn new(id: SourceId, pollutants: &'static [Pollutant], behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            pollutants,
            behavior,
            policy: RetryPolicy::new(Duration::from_millis(50), 2, Backoff::Fixed { delay_ms: 5 }),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn readings(&self, location: &Location, values: &[(Pollutant, f64)]) -> Vec<PollutantReading> {
        values
            .iter()
            .map(|(p, v)| PollutantReading::new(*p, *v, *location, Utc::now(), self.id).unwrap())
            .collect()
    }
}

#[async_trait]
impl DataSource for FakeSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn pollutants(&self) -> &'static [Pollutant] {
        self.pollutants
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn fetch_once(
        &self,
        location: &Location,
        _window: TimeWindow,
    ) -> Result<Vec<PollutantReading>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            Behavior::Readings(values) => Ok(self.readings(location, values)),
            Behavior::Down => Err(SourceError::Status { status: 503, body: "down".into() }),
            Behavior::Rejects => Err(SourceError::Status { status: 401, body: "bad key".into() }),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            Behavior::Flaky(failures, values) => {
                if call < *failures {
                    Err(SourceError::Timeout(Duration::from_millis(1)))
                } else {
                    Ok(self.readings(location, values))
                }
            }
        }
    }
}

const GROUND: &[Pollutant] = &[Pollutant::Pm25, Pollutant::No2, Pollutant::O3];
const SATELLITE: &[Pollutant] = &[Pollutant::No2, Pollutant::O3];

fn config(required: &[Pollutant]) -> Arc<Config> {
    Arc::new(Config {
        geolocation_precision: 2,
        required_pollutants: required.to_vec(),
        ..Config::default()
    })
}

fn aggregator(required: &[Pollutant], sources: Vec<Arc<FakeSource>>) -> ForecastAggregator {
    let sources = sources.into_iter().map(|s| s as Arc<dyn DataSource>).collect();
    ForecastAggregator::new(config(required), sources, Arc::new(ReadingCache::new())).unwrap()
}

#[tokio::test]
async fn complete_forecast_reports_worst_pollutant() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 12.0), (Pollutant::No2, 200.0), (Pollutant::O3, 40.0)]),
    );
    let agg = aggregator(GROUND, vec![ground.clone()]);

    let result = agg.aggregate(29.3759, 47.9774).await.unwrap();

    assert_eq!(result.status, ForecastStatus::Complete);
    assert!(!result.stale);
    assert_eq!(result.aqi.pollutant, Pollutant::No2);
    assert_eq!(result.aqi.index, 120);
    assert_eq!(result.aqi.category, AqiCategory::UnhealthyForSensitiveGroups);
    assert_eq!(result.health_message, AqiCategory::UnhealthyForSensitiveGroups.health_message());

    let order: Vec<_> = result.readings.iter().map(|r| r.reading.pollutant()).collect();
    assert_eq!(order, vec![Pollutant::Pm25, Pollutant::No2, Pollutant::O3]);
    assert_eq!(result.reading(Pollutant::Pm25).unwrap().aqi, 50);
    assert!(result.readings.iter().all(|r| r.freshness == Freshness::Live));
    assert_eq!(result.location.latitude, 29.38);
    assert_eq!(ground.calls(), 1);
}

#[tokio::test]
async fn ground_station_wins_over_satellite() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 5.0), (Pollutant::No2, 10.0), (Pollutant::O3, 20.0)]),
    );
    let satellite = FakeSource::new(
        SourceId::Tempo,
        SATELLITE,
        Behavior::Readings(vec![(Pollutant::No2, 90.0), (Pollutant::O3, 80.0)]),
    );
    // registration order must not matter
    let agg = aggregator(GROUND, vec![satellite.clone(), ground.clone()]);

    let result = agg.aggregate(40.71, -74.0).await.unwrap();

    assert!(result.readings.iter().all(|r| r.reading.source() == SourceId::OpenAq));
    assert_eq!(result.status, ForecastStatus::Complete);
    assert_eq!(satellite.calls(), 1);
}

#[tokio::test]
async fn falls_back_to_satellite_when_ground_is_down() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Down);
    let satellite = FakeSource::new(
        SourceId::Tempo,
        SATELLITE,
        Behavior::Readings(vec![(Pollutant::No2, 60.0), (Pollutant::O3, 30.0)]),
    );
    let agg = aggregator(GROUND, vec![ground.clone(), satellite.clone()]);

    let result = agg.aggregate(40.71, -74.0).await.unwrap();

    assert_eq!(result.status, ForecastStatus::Degraded);
    assert!(result.stale);
    assert_eq!(result.missing_pollutants, vec![Pollutant::Pm25]);
    assert_eq!(result.missing_sources.len(), 1);
    assert_eq!(result.missing_sources[0].source, SourceId::OpenAq);
    assert!(matches!(
        result.missing_sources[0].reason,
        UnavailableReason::Exhausted { attempts: 2, .. }
    ));
    assert!(result.readings.iter().all(|r| r.reading.source() == SourceId::Tempo));
    assert_eq!(result.aqi.pollutant, Pollutant::No2);
    assert_eq!(ground.calls(), 2);
}

#[tokio::test]
async fn one_of_two_sources_unavailable_degrades_without_error() {
    let required = &[Pollutant::Pm25, Pollutant::No2];
    let pm = FakeSource::new(
        SourceId::OpenAq,
        &[Pollutant::Pm25],
        Behavior::Readings(vec![(Pollutant::Pm25, 35.4)]),
    );
    let no2 = FakeSource::new(SourceId::Tempo, &[Pollutant::No2], Behavior::Down);
    let agg = aggregator(required, vec![pm, no2]);

    let result = agg.aggregate(10.0, 10.0).await.unwrap();

    assert!(result.is_degraded());
    assert!(result.stale);
    assert_eq!(result.aqi.index, 100);
    assert_eq!(result.aqi.pollutant, Pollutant::Pm25);
    assert_eq!(result.readings.len(), 1);
    assert_eq!(result.missing_pollutants, vec![Pollutant::No2]);
}

#[tokio::test]
async fn all_sources_down_is_no_data_available() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Down);
    let satellite = FakeSource::new(SourceId::Tempo, SATELLITE, Behavior::Rejects);
    let agg = aggregator(GROUND, vec![ground, satellite.clone()]);

    let err = agg.aggregate(40.71, -74.0).await.unwrap_err();

    match err {
        Error::NoDataAvailable { missing } => {
            let ids: Vec<_> = missing.iter().map(|m| m.source).collect();
            assert_eq!(ids, vec![SourceId::OpenAq, SourceId::Tempo]);
            assert!(matches!(missing[1].reason, UnavailableReason::Rejected { .. }));
        }
        other => panic!("expected NoDataAvailable, got {other:?}"),
    }
    // 4xx is not retried
    assert_eq!(satellite.calls(), 1);
}

#[tokio::test]
async fn repeat_requests_within_ttl_hit_the_cache() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 8.0), (Pollutant::No2, 12.0), (Pollutant::O3, 33.0)]),
    );
    let agg = aggregator(GROUND, vec![ground.clone()]);

    let first = agg.aggregate(29.3759, 47.9774).await.unwrap();
    // same 0.01° cell
    let second = agg.aggregate(29.3771, 47.9801).await.unwrap();

    assert_eq!(ground.calls(), 1);
    assert_eq!(first.aqi.index, second.aqi.index);
    assert!(second.readings.iter().all(|r| r.freshness == Freshness::Cached));
    assert_eq!(second.status, ForecastStatus::Complete);

    // a different cell goes upstream again
    agg.aggregate(29.40, 47.9774).await.unwrap();
    assert_eq!(ground.calls(), 2);
}

#[tokio::test]
async fn pollutants_a_source_lacks_are_cached_as_absent() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 8.0), (Pollutant::No2, 12.0)]),
    );
    let agg = aggregator(GROUND, vec![ground.clone()]);

    let first = agg.aggregate(1.0, 1.0).await.unwrap();
    let second = agg.aggregate(1.0, 1.0).await.unwrap();

    assert_eq!(ground.calls(), 1);
    assert_eq!(first.missing_pollutants, vec![Pollutant::O3]);
    assert_eq!(second.missing_pollutants, vec![Pollutant::O3]);
    assert!(second.missing_sources.is_empty());
    assert!(second.is_degraded());
}

/// Cache seeded with a PM2.5 reading observed `hours_old` hours ago.
fn cache_with_old_reading(hours_old: i64) -> Arc<ReadingCache> {
    let cache = Arc::new(ReadingCache::new());
    let location = Location::new(1.0, 1.0, 2).unwrap();
    let observed_at = Utc::now() - chrono::Duration::hours(hours_old);
    let reading =
        PollutantReading::new(Pollutant::Pm25, 80.0, location, observed_at, SourceId::OpenAq).unwrap();

    cache.put(
        CacheKey::new(&location, SourceId::OpenAq, Pollutant::Pm25),
        Reading::Present(reading),
        Duration::from_secs(3600),
    );
    cache
}

#[tokio::test]
async fn cached_readings_past_max_age_are_refetched() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 4.0)]),
    );
    let sources = vec![ground.clone() as Arc<dyn DataSource>];
    // default max age is 3 hours
    let agg =
        ForecastAggregator::new(config(&[Pollutant::Pm25]), sources, cache_with_old_reading(5))
            .unwrap();

    let result = agg.aggregate(1.0, 1.0).await.unwrap();

    assert_eq!(ground.calls(), 1);
    let pm = result.reading(Pollutant::Pm25).unwrap();
    assert_eq!(pm.freshness, Freshness::Live);
    assert_eq!(pm.reading.concentration(), 4.0);
}

#[tokio::test]
async fn cached_readings_past_max_age_are_never_served() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Rejects);
    let sources = vec![ground.clone() as Arc<dyn DataSource>];
    let agg =
        ForecastAggregator::new(config(&[Pollutant::Pm25]), sources, cache_with_old_reading(5))
            .unwrap();

    let err = agg.aggregate(1.0, 1.0).await.unwrap_err();

    assert!(matches!(err, Error::NoDataAvailable { .. }));
    assert_eq!(ground.calls(), 1);
}

#[tokio::test]
async fn cached_readings_within_max_age_are_served() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Rejects);
    let sources = vec![ground.clone() as Arc<dyn DataSource>];
    let agg =
        ForecastAggregator::new(config(&[Pollutant::Pm25]), sources, cache_with_old_reading(1))
            .unwrap();

    let result = agg.aggregate(1.0, 1.0).await.unwrap();

    assert_eq!(ground.calls(), 0);
    assert_eq!(result.reading(Pollutant::Pm25).unwrap().freshness, Freshness::Cached);
}

#[tokio::test]
async fn failed_fetches_are_not_cached() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Down);
    let agg = aggregator(GROUND, vec![ground.clone()]);

    assert!(agg.aggregate(1.0, 1.0).await.is_err());
    assert!(agg.cache().is_empty());
    assert!(agg.aggregate(1.0, 1.0).await.is_err());
    assert_eq!(ground.calls(), 4);
}

#[tokio::test]
async fn flaky_source_recovers_on_retry() {
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Flaky(1, vec![(Pollutant::Pm25, 20.0), (Pollutant::No2, 20.0), (Pollutant::O3, 20.0)]),
    );
    let agg = aggregator(GROUND, vec![ground.clone()]);

    let result = agg.aggregate(1.0, 1.0).await.unwrap();

    assert_eq!(ground.calls(), 2);
    assert_eq!(result.status, ForecastStatus::Complete);
    assert_eq!(result.aqi.pollutant, Pollutant::Pm25);
}

#[tokio::test(start_paused = true)]
async fn hanging_source_cannot_stall_the_forecast() {
    let stuck = Arc::new(FakeSource {
        id: SourceId::OpenAq,
        pollutants: GROUND,
        behavior: Behavior::Hang,
        policy: RetryPolicy::new(Duration::from_secs(60), 2, Backoff::Fixed { delay_ms: 500 }),
        calls: AtomicUsize::new(0),
    });
    let satellite = FakeSource::new(
        SourceId::Tempo,
        SATELLITE,
        Behavior::Readings(vec![(Pollutant::No2, 20.0), (Pollutant::O3, 20.0)]),
    );
    let agg = aggregator(GROUND, vec![stuck.clone(), satellite]);

    let started = tokio::time::Instant::now();
    let result = agg.aggregate(1.0, 1.0).await.unwrap();

    // timers fire on millisecond ticks
    assert!(started.elapsed() <= agg.deadline() + Duration::from_millis(5));
    assert!(result.is_degraded());
    assert_eq!(result.missing_sources[0].source, SourceId::OpenAq);
    // per-attempt timeouts and the request deadline expire together here
    match &result.missing_sources[0].reason {
        UnavailableReason::Exhausted { attempts, last_error } => {
            assert_eq!(*attempts, 2);
            assert!(last_error.contains("timed out"));
        }
        UnavailableReason::DeadlineExceeded => {}
        other => panic!("unexpected reason {other:?}"),
    }
    assert!((1..=2).contains(&stuck.calls()));
    assert_eq!(agg.cache().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_forecast_leaves_cache_untouched() {
    let slow = Arc::new(FakeSource {
        id: SourceId::OpenAq,
        pollutants: GROUND,
        behavior: Behavior::Hang,
        policy: RetryPolicy::new(Duration::from_secs(30), 1, Backoff::Fixed { delay_ms: 0 }),
        calls: AtomicUsize::new(0),
    });
    let agg = aggregator(GROUND, vec![slow.clone()]);

    let cancelled = tokio::time::timeout(Duration::from_millis(50), agg.aggregate(1.0, 1.0)).await;

    assert!(cancelled.is_err());
    assert_eq!(slow.calls(), 1);
    assert!(agg.cache().is_empty());
}

#[tokio::test]
async fn invalid_coordinates_are_rejected_before_fetching() {
    let ground = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Down);
    let agg = aggregator(GROUND, vec![ground.clone()]);

    let err = agg.aggregate(123.0, 0.0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(ground.calls(), 0);
}

#[tokio::test]
async fn sources_without_required_pollutants_are_not_called() {
    let satellite = FakeSource::new(
        SourceId::Tempo,
        SATELLITE,
        Behavior::Readings(vec![(Pollutant::No2, 20.0)]),
    );
    let ground = FakeSource::new(
        SourceId::OpenAq,
        GROUND,
        Behavior::Readings(vec![(Pollutant::Pm25, 3.0)]),
    );
    let agg = aggregator(&[Pollutant::Pm25], vec![satellite.clone(), ground]);

    let result = agg.aggregate(1.0, 1.0).await.unwrap();
    assert_eq!(result.status, ForecastStatus::Complete);
    assert_eq!(satellite.calls(), 0);
}

#[test]
fn deadline_covers_slowest_source() {
    let fast = FakeSource::new(SourceId::OpenAq, GROUND, Behavior::Down);
    let slow = Arc::new(FakeSource {
        id: SourceId::Tempo,
        pollutants: SATELLITE,
        behavior: Behavior::Down,
        policy: RetryPolicy::new(Duration::from_secs(2), 3, Backoff::Fixed { delay_ms: 500 }),
        calls: AtomicUsize::new(0),
    });
    let agg = aggregator(GROUND, vec![fast, slow]);

    assert_eq!(agg.deadline(), Duration::from_secs(7));
}
