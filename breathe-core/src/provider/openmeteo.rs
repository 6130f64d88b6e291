use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

use crate::{
    config::SourceConfig,
    error::SourceError,
    model::{Location, Pollutant, PollutantReading, SourceId, TimeWindow},
    provider::{RawProviderResponse, get_json, normalize_value},
    retry::RetryPolicy,
};

use super::DataSource;

/// Open-Meteo variable name for each pollutant.
const VARIABLES: &[(&str, Pollutant)] = &[
    ("pm2_5", Pollutant::Pm25),
    ("pm10", Pollutant::Pm10),
    ("nitrogen_dioxide", Pollutant::No2),
    ("ozone", Pollutant::O3),
    ("sulphur_dioxide", Pollutant::So2),
    ("carbon_monoxide", Pollutant::Co),
];

/// Modelled concentrations from the Open-Meteo air-quality forecast.
#[derive(Debug, Clone)]
pub struct OpenMeteoSource {
    base_url: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    http: Client,
}

impl OpenMeteoSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base_url: config.base_url(SourceId::OpenMeteo),
            api_key: config.api_key.clone(),
            policy: config.retry_policy(),
            http: Client::new(),
        }
    }

    pub async fn fetch_raw(&self, location: &Location) -> Result<RawProviderResponse, SourceError> {
        let url = format!("{}/air-quality", self.base_url);
        let current = VARIABLES.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(",");

        let mut query = vec![
            ("latitude", location.latitude.to_string()),
            ("longitude", location.longitude.to_string()),
            ("current", current),
            ("timezone", "GMT".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.clone()));
        }

        let parsed: OpenMeteoResponse = get_json(self.http.get(url).query(&query)).await?;
        Ok(RawProviderResponse::OpenMeteo(parsed))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OmCurrent {
    time: String,
    #[serde(flatten)]
    values: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenMeteoResponse {
    current: OmCurrent,
    #[serde(default)]
    current_units: HashMap<String, String>,
}

impl OpenMeteoResponse {
    /// `current.time` is local to the requested timezone (GMT) and has no offset.
    fn observed_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.current.time, "%Y-%m-%dT%H:%M")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub(crate) fn normalize(&self, location: &Location, window: TimeWindow) -> Vec<PollutantReading> {
        let Some(observed_at) = self.observed_at() else {
            tracing::warn!(time = %self.current.time, "unparseable Open-Meteo timestamp");
            return Vec::new();
        };

        VARIABLES
            .iter()
            .filter_map(|(name, pollutant)| {
                let value = self.current.values.get(*name)?.as_f64()?;
                let unit = self.current_units.get(*name)?;
                normalize_value(
                    SourceId::OpenMeteo,
                    *pollutant,
                    value,
                    unit,
                    location,
                    observed_at,
                    window,
                )
            })
            .collect()
    }
}

#[async_trait]
impl DataSource for OpenMeteoSource {
    fn id(&self) -> SourceId {
        SourceId::OpenMeteo
    }

    fn pollutants(&self) -> &'static [Pollutant] {
        Pollutant::all()
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
