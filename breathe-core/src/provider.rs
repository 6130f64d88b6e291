use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    Config,
    error::SourceError,
    model::{Location, Pollutant, PollutantReading, SourceId, TimeWindow, UnavailableReason},
    provider::{openaq::OpenAqSource, openmeteo::OpenMeteoSource, tempo::TempoSource},
    retry::RetryPolicy,
    units,
};

pub mod openaq;
pub mod openmeteo;
pub mod tempo;

/// An upstream air-quality provider.
///
/// Implementations perform a single attempt and hold no state beyond their
/// configuration; retries, timeouts and caching happen around them.
#[async_trait]
pub trait DataSource: Send + Sync + Debug {
    fn id(&self) -> SourceId;

    /// Pollutants this source can report.
    fn pollutants(&self) -> &'static [Pollutant];

    fn retry_policy(&self) -> RetryPolicy;

    /// One attempt. Readings outside `window` are left out.
    async fn fetch_once(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<PollutantReading>, SourceError>;
}

/// Provider-specific payloads, normalized into [`PollutantReading`]s at the
/// adapter boundary.
#[derive(Debug, Clone)]
pub enum RawProviderResponse {
    OpenAq(openaq::OpenAqResponse),
    Tempo(tempo::TempoResponse),
    OpenMeteo(openmeteo::OpenMeteoResponse),
}

impl RawProviderResponse {
    pub fn source(&self) -> SourceId {
        match self {
            RawProviderResponse::OpenAq(_) => SourceId::OpenAq,
            RawProviderResponse::Tempo(_) => SourceId::Tempo,
            RawProviderResponse::OpenMeteo(_) => SourceId::OpenMeteo,
        }
    }

    pub fn normalize(&self, location: &Location, window: TimeWindow) -> Vec<PollutantReading> {
        let readings = match self {
            RawProviderResponse::OpenAq(raw) => raw.normalize(location, window),
            RawProviderResponse::Tempo(raw) => raw.normalize(location, window),
            RawProviderResponse::OpenMeteo(raw) => raw.normalize(location, window),
        };
        latest_per_pollutant(readings)
    }
}

/// Result of a fetch after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Available(Vec<PollutantReading>),
    Unavailable(UnavailableReason),
}

/// Fetch from `source`, bounding each attempt by the policy timeout and
/// retrying transient failures. Never returns a transport error.
pub async fn fetch(source: &dyn DataSource, location: &Location, window: TimeWindow) -> SourceOutcome {
    let id = source.id();
    let policy = source.retry_policy();
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.backoff.delay_for_retry(attempt - 1);
            info!(source = %id, attempt = attempt + 1, ?delay, "retrying fetch");
            tokio::time::sleep(delay).await;
        }

        let result = match tokio::time::timeout(policy.timeout, source.fetch_once(location, window)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(policy.timeout)),
        };

        match result {
            Ok(readings) => {
                if attempt > 0 {
                    info!(source = %id, retries = attempt, "fetch succeeded after retries");
                }
                debug!(source = %id, count = readings.len(), "fetched readings");
                return SourceOutcome::Available(readings);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    source = %id,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "retryable fetch error"
                );
                last_error = Some(e);
            }
            Err(e) => {
                warn!(source = %id, error = %e, "fetch failed, not retrying");
                return SourceOutcome::Unavailable(UnavailableReason::Rejected {
                    error: e.to_string(),
                });
            }
        }
    }

    SourceOutcome::Unavailable(UnavailableReason::Exhausted {
        attempts: policy.max_attempts,
        last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Construct every enabled source from config, in merge-priority order.
pub fn sources_from_config(config: &Config) -> Vec<Arc<dyn DataSource>> {
    let radius_km = config.search_radius_km();

    config
        .enabled_sources()
        .into_iter()
        .map(|id| {
            let cfg = config.source_config(id);
            let source: Arc<dyn DataSource> = match id {
                SourceId::OpenAq => Arc::new(OpenAqSource::new(&cfg, radius_km)),
                SourceId::Tempo => Arc::new(TempoSource::new(&cfg)),
                SourceId::OpenMeteo => Arc::new(OpenMeteoSource::new(&cfg)),
            };
            source
        })
        .collect()
}

/// Send a GET and decode a JSON body, mapping failures onto [`SourceError`].
pub(crate) async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SourceError> {
    let res = request.send().await?;

    let status = res.status();
    let body = res.text().await?;

    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        });
    }

    serde_json::from_str(&body).map_err(|e| SourceError::Parse(e.to_string()))
}

/// Build a reading from a provider value, or drop it with a warning.
pub(crate) fn normalize_value(
    source: SourceId,
    pollutant: Pollutant,
    value: f64,
    unit: &str,
    location: &Location,
    observed_at: DateTime<Utc>,
    window: TimeWindow,
) -> Option<PollutantReading> {
    if !window.contains(observed_at) {
        debug!(source = %source, %pollutant, %observed_at, "reading outside time window");
        return None;
    }

    let concentration = match units::to_canonical(pollutant, value, unit) {
        Ok(c) => c,
        Err(e) => {
            warn!(source = %source, %pollutant, error = %e, "dropping reading");
            return None;
        }
    };

    PollutantReading::new(pollutant, concentration, *location, observed_at, source).ok()
}

fn latest_per_pollutant(readings: Vec<PollutantReading>) -> Vec<PollutantReading> {
    let mut out: Vec<PollutantReading> = Vec::with_capacity(readings.len());
    for reading in readings {
        match out.iter_mut().find(|r| r.pollutant() == reading.pollutant()) {
            Some(existing) if existing.observed_at() < reading.observed_at() => *existing = reading,
            Some(_) => {}
            None => out.push(reading),
        }
    }
    out
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
