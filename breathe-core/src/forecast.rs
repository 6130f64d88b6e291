//! Multi-source forecast aggregation.
//!
//! For each request: consult the cache per (source, pollutant), fan out to
//! the sources with misses, write successful answers back, merge by source
//! priority and report the worst pollutant's AQI.

use chrono::Utc;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    Config,
    aqi::AqiCalculator,
    cache::{CacheKey, ReadingCache},
    error::Error,
    model::{
        AqiResult, ContributingReading, ForecastResult, ForecastStatus, Freshness, Location,
        MissingSource, Pollutant, PollutantReading, Reading, SourceId, TimeWindow,
        UnavailableReason,
    },
    provider::{self, DataSource, SourceOutcome},
};

/// Lifecycle of a single `aggregate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Fetching,
    Merging,
    Computed,
    Degraded,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Pending => "PENDING",
            RequestState::Fetching => "FETCHING",
            RequestState::Merging => "MERGING",
            RequestState::Computed => "COMPUTED",
            RequestState::Degraded => "DEGRADED",
        };
        f.write_str(s)
    }
}

/// What one source contributed to a request.
type SourceReadings = HashMap<Pollutant, (Reading, Freshness)>;

pub struct ForecastAggregator {
    config: Arc<Config>,
    /// Sorted by merge priority.
    sources: Vec<Arc<dyn DataSource>>,
    cache: Arc<ReadingCache>,
    calculator: AqiCalculator,
}

impl fmt::Debug for ForecastAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForecastAggregator")
            .field("sources", &self.sources)
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

impl ForecastAggregator {
    pub fn new(
        config: Arc<Config>,
        mut sources: Vec<Arc<dyn DataSource>>,
        cache: Arc<ReadingCache>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let calculator = config.calculator()?;
        sources.sort_by_key(|s| (s.id().kind(), s.id()));

        Ok(Self { config, sources, cache, calculator })
    }

    /// Aggregator over every enabled source in `config`, with a fresh cache.
    pub fn from_config(config: Arc<Config>) -> Result<Self, Error> {
        let sources = provider::sources_from_config(&config);
        Self::new(config, sources, Arc::new(ReadingCache::new()))
    }

    pub fn cache(&self) -> &Arc<ReadingCache> {
        &self.cache
    }

    pub fn calculator(&self) -> &AqiCalculator {
        &self.calculator
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.iter().map(|s| s.id())
    }

    /// Overall request deadline: the worst case of the slowest source.
    pub fn deadline(&self) -> Duration {
        self.sources
            .iter()
            .map(|s| s.retry_policy().worst_case())
            .max()
            .unwrap_or_default()
    }

    fn wanted(&self, source: &dyn DataSource) -> Vec<Pollutant> {
        self.config
            .required_pollutants
            .iter()
            .copied()
            .filter(|p| source.pollutants().contains(p))
            .collect()
    }

    fn advance(&self, location: &Location, state: &mut RequestState, next: RequestState) {
        debug!(%location, from = %state, to = %next, "forecast state");
        *state = next;
    }

    pub async fn aggregate(&self, latitude: f64, longitude: f64) -> Result<ForecastResult, Error> {
        let location = Location::new(latitude, longitude, self.config.geolocation_precision)?;
        let window = self.config.reading_window(Utc::now());
        let mut state = RequestState::Pending;

        let mut gathered: HashMap<SourceId, SourceReadings> = HashMap::new();
        let mut to_fetch = Vec::new();

        for source in &self.sources {
            let wanted = self.wanted(source.as_ref());
            if wanted.is_empty() {
                continue;
            }

            // readings that aged out of the window since caching count as misses
            let hits: SourceReadings = wanted
                .iter()
                .filter_map(|p| {
                    let cached = self.cache.get(&CacheKey::new(&location, source.id(), *p))?;
                    let aged_out = matches!(
                        &cached,
                        Reading::Present(r) if !window.contains(r.observed_at())
                    );
                    (!aged_out).then_some((*p, (cached, Freshness::Cached)))
                })
                .collect();

            if hits.len() == wanted.len() {
                debug!(source = %source.id(), %location, "cache hit");
                gathered.insert(source.id(), hits);
            } else {
                debug!(source = %source.id(), %location, "cache miss");
                to_fetch.push(Arc::clone(source));
            }
        }

        self.advance(&location, &mut state, RequestState::Fetching);
        let mut missing_sources = Vec::new();

        for (source, outcome) in self.fetch_all(&to_fetch, location, window).await {
            match outcome {
                SourceOutcome::Available(readings) => {
                    let fresh = self.write_through(source.as_ref(), &location, readings);
                    gathered.insert(source.id(), fresh);
                }
                SourceOutcome::Unavailable(reason) => {
                    warn!(source = %source.id(), %location, %reason, "source unavailable");
                    missing_sources.push(MissingSource { source: source.id(), reason });
                }
            }
        }
        missing_sources.sort_by_key(|m| (m.source.kind(), m.source));

        self.advance(&location, &mut state, RequestState::Merging);

        let mut chosen: Vec<(PollutantReading, Freshness)> = Vec::new();
        let mut missing_pollutants = Vec::new();

        for pollutant in &self.config.required_pollutants {
            let best = self.sources.iter().find_map(|source| {
                match gathered.get(&source.id())?.get(pollutant)? {
                    (Reading::Present(reading), freshness) => Some((reading.clone(), *freshness)),
                    (Reading::Absent, _) => None,
                }
            });

            match best {
                Some(found) => chosen.push(found),
                None => missing_pollutants.push(*pollutant),
            }
        }

        if chosen.is_empty() {
            self.advance(&location, &mut state, RequestState::Degraded);
            return Err(Error::NoDataAvailable { missing: missing_sources });
        }

        let mut readings = Vec::with_capacity(chosen.len());
        let mut governing: Option<AqiResult> = None;

        for (reading, freshness) in chosen {
            let result = self.calculator.compute(reading.pollutant(), reading.concentration())?;
            readings.push(ContributingReading { aqi: result.index, reading, freshness });

            if governing.as_ref().is_none_or(|g| result.index > g.index) {
                governing = Some(result);
            }
        }

        let Some(aqi) = governing else {
            return Err(Error::NoDataAvailable { missing: missing_sources });
        };

        let status = if missing_sources.is_empty() && missing_pollutants.is_empty() {
            self.advance(&location, &mut state, RequestState::Computed);
            ForecastStatus::Complete
        } else {
            self.advance(&location, &mut state, RequestState::Degraded);
            ForecastStatus::Degraded
        };

        Ok(ForecastResult {
            location,
            health_message: aqi.category.health_message(),
            aqi,
            status,
            stale: status == ForecastStatus::Degraded,
            readings,
            missing_sources,
            missing_pollutants,
        })
    }

    /// Fetch concurrently, bounded by [`deadline`](Self::deadline). Dropping
    /// the returned future aborts every outstanding fetch.
    async fn fetch_all(
        &self,
        sources: &[Arc<dyn DataSource>],
        location: Location,
        window: TimeWindow,
    ) -> Vec<(Arc<dyn DataSource>, SourceOutcome)> {
        let deadline = self.deadline();
        let mut tasks = JoinSet::new();

        for source in sources {
            let source = Arc::clone(source);
            tasks.spawn(async move {
                let outcome =
                    match tokio::time::timeout(deadline, provider::fetch(source.as_ref(), &location, window))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => SourceOutcome::Unavailable(UnavailableReason::DeadlineExceeded),
                    };
                (source.id(), outcome)
            });
        }

        let mut outcomes: HashMap<SourceId, SourceOutcome> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(e) => warn!(error = %e, "fetch task did not complete"),
            }
        }

        sources
            .iter()
            .map(|source| {
                let outcome = outcomes
                    .remove(&source.id())
                    .unwrap_or(SourceOutcome::Unavailable(UnavailableReason::Cancelled));
                (Arc::clone(source), outcome)
            })
            .collect()
    }

    /// Cache a successful answer. Required pollutants the source did not
    /// report are cached as absent so the next request skips the call.
    fn write_through(
        &self,
        source: &dyn DataSource,
        location: &Location,
        readings: Vec<PollutantReading>,
    ) -> SourceReadings {
        let ttl = self.config.ttl_for(source.id());
        let mut fresh = SourceReadings::new();

        for reading in readings {
            let pollutant = reading.pollutant();
            let value = Reading::Present(reading);
            self.cache.put(CacheKey::new(location, source.id(), pollutant), value.clone(), ttl);
            fresh.insert(pollutant, (value, Freshness::Live));
        }

        for pollutant in self.wanted(source) {
            if !fresh.contains_key(&pollutant) {
                let key = CacheKey::new(location, source.id(), pollutant);
                self.cache.put(key, Reading::Absent, ttl);
                fresh.insert(pollutant, (Reading::Absent, Freshness::Live));
            }
        }

        fresh
    }
}
