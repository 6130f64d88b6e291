//! Core library for the `breathe` air quality tool.
//!
//! This crate defines:
//! - The AQI calculator and US EPA breakpoint tables
//! - Adapters for ground-station, satellite and weather-model sources
//! - A TTL reading cache shared across requests
//! - The forecast aggregator that merges sources into one result
//! - Configuration & credentials handling
//!
//! It is used by `breathe-cli`, but can also be reused by other binaries or services.

pub mod aqi;
pub mod cache;
pub mod config;
pub mod error;
pub mod forecast;
pub mod model;
pub mod provider;
pub mod retry;
pub mod units;

pub use aqi::{AqiCalculator, AqiCategory, category};
pub use cache::{CacheKey, ReadingCache};
pub use config::{CacheConfig, Config, SourceConfig};
pub use error::{Error, SourceError};
pub use forecast::ForecastAggregator;
pub use model::{
    AqiResult, ForecastResult, ForecastStatus, Freshness, Location, Pollutant, PollutantReading,
    SourceId,
};
pub use provider::{DataSource, SourceOutcome};
pub use retry::{Backoff, RetryPolicy};
