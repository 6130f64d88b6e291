use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aqi::AqiCategory;
use crate::error::Error;

/// Pollutants with a US EPA breakpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pollutant {
    Pm25,
    Pm10,
    O3,
    No2,
    So2,
    Co,
}

impl Pollutant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "pm25",
            Pollutant::Pm10 => "pm10",
            Pollutant::O3 => "o3",
            Pollutant::No2 => "no2",
            Pollutant::So2 => "so2",
            Pollutant::Co => "co",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "PM2.5",
            Pollutant::Pm10 => "PM10",
            Pollutant::O3 => "O₃",
            Pollutant::No2 => "NO₂",
            Pollutant::So2 => "SO₂",
            Pollutant::Co => "CO",
        }
    }

    /// Canonical unit of this pollutant's breakpoint table.
    pub fn unit(&self) -> &'static str {
        match self {
            Pollutant::Pm25 | Pollutant::Pm10 => "µg/m³",
            Pollutant::O3 | Pollutant::No2 | Pollutant::So2 => "ppb",
            Pollutant::Co => "ppm",
        }
    }

    pub const fn all() -> &'static [Pollutant] {
        &[
            Pollutant::Pm25,
            Pollutant::Pm10,
            Pollutant::O3,
            Pollutant::No2,
            Pollutant::So2,
            Pollutant::Co,
        ]
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Pollutant {
    type Error = Error;

    /// Accepts the short ids plus the parameter names upstream APIs use.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.trim().to_lowercase();

        match lower.as_str() {
            "pm25" | "pm2.5" | "pm2_5" => Ok(Pollutant::Pm25),
            "pm10" => Ok(Pollutant::Pm10),
            "o3" | "ozone" => Ok(Pollutant::O3),
            "no2" | "nitrogen_dioxide" => Ok(Pollutant::No2),
            "so2" | "sulphur_dioxide" | "sulfur_dioxide" => Ok(Pollutant::So2),
            "co" | "carbon_monoxide" => Ok(Pollutant::Co),
            _ => Err(Error::invalid(format!(
                "Unknown pollutant '{value}'. Supported pollutants: pm25, pm10, o3, no2, so2, co."
            ))),
        }
    }
}

impl std::str::FromStr for Pollutant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pollutant::try_from(s)
    }
}

/// Upstream data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    OpenAq,
    Tempo,
    OpenMeteo,
}

/// What a source measures. Ordering is merge priority: earlier wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    GroundStation,
    Satellite,
    WeatherModel,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::OpenAq => "openaq",
            SourceId::Tempo => "tempo",
            SourceId::OpenMeteo => "openmeteo",
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceId::OpenAq => SourceKind::GroundStation,
            SourceId::Tempo => SourceKind::Satellite,
            SourceId::OpenMeteo => SourceKind::WeatherModel,
        }
    }

    pub const fn all() -> &'static [SourceId] {
        &[SourceId::OpenAq, SourceId::Tempo, SourceId::OpenMeteo]
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SourceId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openaq" => Ok(SourceId::OpenAq),
            "tempo" => Ok(SourceId::Tempo),
            "openmeteo" => Ok(SourceId::OpenMeteo),
            _ => Err(Error::invalid(format!(
                "Unknown source '{value}'. Supported sources: openaq, tempo, openmeteo."
            ))),
        }
    }
}

impl std::str::FromStr for SourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::try_from(s)
    }
}

/// A coordinate rounded to the configured geolocation precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip)]
    precision: u32,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, precision: u32) -> Result<Self, Error> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::invalid(format!("latitude {latitude} is out of range")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::invalid(format!("longitude {longitude} is out of range")));
        }

        let scale = 10f64.powi(precision as i32);
        Ok(Self {
            latitude: (latitude * scale).round() / scale,
            longitude: (longitude * scale).round() / scale,
            precision,
        })
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Integer grid cell; equal for every coordinate that rounds to this location.
    pub fn cell(&self) -> (i64, i64) {
        let scale = 10f64.powi(self.precision as i32);
        (
            (self.latitude * scale).round() as i64,
            (self.longitude * scale).round() as i64,
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.precision as usize;
        write!(f, "{:.p$}, {:.p$}", self.latitude, self.longitude)
    }
}

/// Interval of observation times a reading must fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn ending_at(end: DateTime<Utc>, max_age: Duration) -> Self {
        Self { start: end - max_age, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// One normalized concentration measurement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollutantReading {
    pollutant: Pollutant,
    concentration: f64,
    unit: &'static str,
    location: Location,
    observed_at: DateTime<Utc>,
    source: SourceId,
}

impl PollutantReading {
    /// `concentration` must already be in the pollutant's canonical unit.
    pub fn new(
        pollutant: Pollutant,
        concentration: f64,
        location: Location,
        observed_at: DateTime<Utc>,
        source: SourceId,
    ) -> Result<Self, Error> {
        if !concentration.is_finite() || concentration < 0.0 {
            return Err(Error::invalid(format!(
                "{pollutant} concentration must be a non-negative finite number, got {concentration}"
            )));
        }

        Ok(Self {
            pollutant,
            concentration,
            unit: pollutant.unit(),
            location,
            observed_at,
            source,
        })
    }

    pub fn pollutant(&self) -> Pollutant {
        self.pollutant
    }

    pub fn concentration(&self) -> f64 {
        self.concentration
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn source(&self) -> SourceId {
        self.source
    }
}

/// Cached result of asking a source for a pollutant.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Present(PollutantReading),
    /// The source answered but had nothing usable for this pollutant.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Live,
    Cached,
}

/// Output of the AQI calculator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AqiResult {
    pub index: u16,
    pub category: AqiCategory,
    pub pollutant: Pollutant,
    pub computed_at: DateTime<Utc>,
}

/// Why a source contributed nothing to a forecast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last_error: String },
    /// A non-retryable error ended the fetch early.
    Rejected { error: String },
    /// The forecast deadline passed before the source answered.
    DeadlineExceeded,
    /// The fetch task was aborted or panicked.
    Cancelled,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::Exhausted { attempts, last_error } => {
                write!(f, "gave up after {attempts} attempts: {last_error}")
            }
            UnavailableReason::Rejected { error } => write!(f, "{error}"),
            UnavailableReason::DeadlineExceeded => f.write_str("forecast deadline exceeded"),
            UnavailableReason::Cancelled => f.write_str("fetch cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingSource {
    pub source: SourceId,
    pub reason: UnavailableReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastStatus {
    Complete,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributingReading {
    pub reading: PollutantReading,
    pub freshness: Freshness,
    /// Sub-index of this pollutant alone.
    pub aqi: u16,
}

/// Per-location forecast produced by one `aggregate` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub location: Location,
    pub aqi: AqiResult,
    pub status: ForecastStatus,
    /// Set when any required source or pollutant is missing.
    pub stale: bool,
    pub readings: Vec<ContributingReading>,
    pub missing_sources: Vec<MissingSource>,
    pub missing_pollutants: Vec<Pollutant>,
    pub health_message: &'static str,
}

impl ForecastResult {
    pub fn is_degraded(&self) -> bool {
        self.status == ForecastStatus::Degraded
    }

    pub fn reading(&self, pollutant: Pollutant) -> Option<&ContributingReading> {
        self.readings.iter().find(|r| r.reading.pollutant() == pollutant)
    }
}
