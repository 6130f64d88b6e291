use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
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

/// OpenAQ caps radius searches at 25 km.
const MAX_RADIUS_M: u32 = 25_000;
const LOCATION_LIMIT: u32 = 10;

/// Ground-station readings from OpenAQ v3.
#[derive(Debug, Clone)]
pub struct OpenAqSource {
    base_url: String,
    api_key: Option<String>,
    radius_m: u32,
    policy: RetryPolicy,
    http: Client,
}

impl OpenAqSource {
    pub fn new(config: &SourceConfig, radius_km: f64) -> Self {
        let radius_m = (radius_km * 1000.0).round().clamp(1.0, f64::from(MAX_RADIUS_M)) as u32;

        Self {
            base_url: config.base_url(SourceId::OpenAq),
            api_key: config.api_key.clone(),
            radius_m,
            policy: config.retry_policy(),
            http: Client::new(),
        }
    }

    /// GET with the `X-API-Key` header when a key is configured.
    fn get(&self, url: String) -> RequestBuilder {
        let request = self.http.get(url);
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    /// Nearest station with at least one sensor, if any lies inside the radius.
    async fn nearest_station(&self, location: &Location) -> Result<Option<OaLocation>, SourceError> {
        let url = format!("{}/locations", self.base_url);
        let coordinates = format!("{},{}", location.latitude, location.longitude);

        let parsed: OaLocationsResponse = get_json(self.get(url).query(&[
            ("coordinates", coordinates),
            ("radius", self.radius_m.to_string()),
            ("limit", LOCATION_LIMIT.to_string()),
        ]))
        .await?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|l| !l.sensors.is_empty())
            .min_by(|a, b| {
                let da = a.distance.unwrap_or(f64::MAX);
                let db = b.distance.unwrap_or(f64::MAX);
                da.total_cmp(&db)
            }))
    }

    async fn latest(&self, station_id: i64) -> Result<Vec<OaLatest>, SourceError> {
        let url = format!("{}/locations/{}/latest", self.base_url, station_id);

        let parsed: OaLatestResponse = get_json(self.get(url)).await?;

        Ok(parsed.results)
    }

    pub async fn fetch_raw(&self, location: &Location) -> Result<RawProviderResponse, SourceError> {
        let Some(station) = self.nearest_station(location).await? else {
            tracing::debug!(%location, radius_m = self.radius_m, "no OpenAQ station nearby");
            return Ok(RawProviderResponse::OpenAq(OpenAqResponse::default()));
        };

        let latest = self.latest(station.id).await?;

        Ok(RawProviderResponse::OpenAq(OpenAqResponse {
            station: Some(station),
            latest,
        }))
    }
}

/// Station metadata plus its latest sensor values.
#[derive(Debug, Clone, Default)]
pub struct OpenAqResponse {
    pub station: Option<OaLocation>,
    pub latest: Vec<OaLatest>,
}

impl OpenAqResponse {
    pub(crate) fn normalize(&self, location: &Location, window: TimeWindow) -> Vec<PollutantReading> {
        let Some(station) = &self.station else {
            return Vec::new();
        };

        let sensors: HashMap<i64, &OaParameter> =
            station.sensors.iter().map(|s| (s.id, &s.parameter)).collect();

        self.latest
            .iter()
            .filter_map(|m| {
                let parameter = sensors.get(&m.sensors_id)?;
                let pollutant = Pollutant::try_from(parameter.name.as_str()).ok()?;
                normalize_value(
                    SourceId::OpenAq,
                    pollutant,
                    m.value?,
                    &parameter.units,
                    location,
                    m.datetime.utc,
                    window,
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OaParameter {
    name: String,
    units: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OaSensor {
    id: i64,
    parameter: OaParameter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OaLocation {
    id: i64,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    sensors: Vec<OaSensor>,
}

#[derive(Debug, Deserialize)]
struct OaLocationsResponse {
    results: Vec<OaLocation>,
}

#[derive(Debug, Clone, Deserialize)]
struct OaDatetime {
    utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OaLatest {
    datetime: OaDatetime,
    value: Option<f64>,
    sensors_id: i64,
}

#[derive(Debug, Deserialize)]
struct OaLatestResponse {
    results: Vec<OaLatest>,
}

#[async_trait]
impl DataSource for OpenAqSource {
    fn id(&self) -> SourceId {
        SourceId::OpenAq
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
