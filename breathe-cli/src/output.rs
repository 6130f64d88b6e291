//! Human-readable and JSON rendering of core results.

use anyhow::{Context, Result};
use breathe_core::{AqiResult, Config, ForecastResult, Freshness, SourceId};
use chrono::Local;
use serde::Serialize;
use std::fmt;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?;
    println!("{json}");
    Ok(())
}

pub fn calc_json(result: &AqiResult) -> serde_json::Value {
    serde_json::json!({
        "aqi": result.index,
        "category": result.category.label(),
        "pollutant": result.pollutant,
        "color": result.category.color(),
    })
}

pub fn calc_human(result: &AqiResult, concentration: f64) -> String {
    format!(
        "{} {} {}: AQI {} ({})\n{}",
        result.pollutant.display_name(),
        concentration,
        result.pollutant.unit(),
        result.index,
        result.category,
        result.category.health_message(),
    )
}

/// Multi-line human rendering of a forecast.
pub struct ForecastReport<'a>(pub &'a ForecastResult);

impl fmt::Display for ForecastReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let forecast = self.0;

        write!(
            f,
            "Air quality at {}: AQI {} ({})",
            forecast.location, forecast.aqi.index, forecast.aqi.category
        )?;
        write!(f, "\nGoverning pollutant: {}", forecast.aqi.pollutant.display_name())?;
        write!(f, "\n{}", forecast.health_message)?;

        if forecast.is_degraded() {
            write!(f, "\nStatus: degraded (stale data possible)")?;
        }

        writeln!(f)?;
        for r in &forecast.readings {
            let freshness = match r.freshness {
                Freshness::Live => "live",
                Freshness::Cached => "cached",
            };
            let observed = r.reading.observed_at().with_timezone(&Local);

            write!(
                f,
                "\n  {:<6} {:>9.2} {:<6} AQI {:>3}  {:<9} {:<6} observed {}",
                r.reading.pollutant().display_name(),
                r.reading.concentration(),
                r.reading.unit(),
                r.aqi,
                r.reading.source(),
                freshness,
                observed.format("%Y-%m-%d %H:%M"),
            )?;
        }

        if !forecast.missing_pollutants.is_empty() {
            let names: Vec<_> = forecast.missing_pollutants.iter().map(|p| p.display_name()).collect();
            write!(f, "\n\nNo data for: {}", names.join(", "))?;
        }

        for missing in &forecast.missing_sources {
            write!(f, "\nSource {} unavailable: {}", missing.source, missing.reason)?;
        }

        Ok(())
    }
}

/// Every known source with its effective fetch settings.
pub struct SourcesReport<'a>(pub &'a Config);

impl fmt::Display for SourcesReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;

        for (i, id) in SourceId::all().iter().enumerate() {
            let cfg = config.source_config(*id);
            let policy = cfg.retry_policy();
            let key = if config.source_api_key(*id).is_some() { "set" } else { "not set" };

            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{:<10} {:<9} {}\n           api key {}, timeout {:?}, {} attempts, cache ttl {:?}",
                id.as_str(),
                if cfg.enabled { "enabled" } else { "disabled" },
                cfg.base_url(*id),
                key,
                policy.timeout,
                policy.max_attempts,
                config.ttl_for(*id),
            )?;
        }

        Ok(())
    }
}
