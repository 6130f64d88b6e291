use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::SourceConfig,
    error::SourceError,
    model::{Location, Pollutant, PollutantReading, SourceId, TimeWindow},
    provider::{RawProviderResponse, get_json, normalize_value},
    retry::RetryPolicy,
};

use super::DataSource;

const POLLUTANTS: &[Pollutant] = &[Pollutant::No2, Pollutant::O3];

/// Surface estimates derived from NASA TEMPO satellite column measurements.
#[derive(Debug, Clone)]
pub struct TempoSource {
    base_url: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    http: Client,
}

impl TempoSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base_url: config.base_url(SourceId::Tempo),
            api_key: config.api_key.clone(),
            policy: config.retry_policy(),
            http: Client::new(),
        }
    }

    pub async fn fetch_raw(&self, location: &Location) -> Result<RawProviderResponse, SourceError> {
        let api_key = self.api_key.as_deref().ok_or(SourceError::MissingCredentials)?;
        let url = format!("{}/observations", self.base_url);

        let parsed: TempoResponse = get_json(self.http.get(url).query(&[
            ("lat", location.latitude.to_string()),
            ("lon", location.longitude.to_string()),
            ("api_key", api_key.to_string()),
        ]))
        .await?;

        Ok(RawProviderResponse::Tempo(parsed))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TempoProduct {
    species: String,
    value: Option<f64>,
    unit: String,
}

/// One satellite pass over the requested point.
#[derive(Debug, Clone, Deserialize)]
pub struct TempoResponse {
    observed_at: DateTime<Utc>,
    #[serde(default)]
    products: Vec<TempoProduct>,
}

impl TempoResponse {
    pub(crate) fn normalize(&self, location: &Location, window: TimeWindow) -> Vec<PollutantReading> {
        self.products
            .iter()
            .filter_map(|p| {
                let pollutant = Pollutant::try_from(p.species.as_str()).ok()?;
                if !POLLUTANTS.contains(&pollutant) {
                    return None;
                }
                normalize_value(
                    SourceId::Tempo,
                    pollutant,
                    p.value?,
                    &p.unit,
                    location,
                    self.observed_at,
                    window,
                )
            })
            .collect()
    }
}

#[async_trait]
impl DataSource for TempoSource {
    fn id(&self) -> SourceId {
        SourceId::Tempo
    }

    fn pollutants(&self) -> &'static [Pollutant] {
        POLLUTANTS
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn fetch_once(
        &self,
        location: &Location,
        window: TimeWindow,
    ) -> Result<Vec<PollutantReading>, SourceError> {
        Ok(self.fetch_raw(location).await?.normalize(location, window))
    }
}
