use anyhow::{Context, Result};
use breathe_core::{Config, ForecastAggregator, Pollutant, SourceConfig, SourceId};
use clap::{Parser, Subcommand};
use inquire::{Confirm, Password, PasswordDisplayMode, Text};
use std::{path::PathBuf, sync::Arc};

use crate::output;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "breathe", version, about = "Air quality index CLI")]
pub struct Cli {
    /// Use this config file instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials and endpoint for a specific source.
    Configure {
        /// Source short name: "openaq", "tempo" or "openmeteo".
        source: SourceId,
    },

    /// Compute the AQI for a single pollutant concentration.
    Calc {
        /// Pollutant, e.g. "pm25", "o3", "no2".
        pollutant: Pollutant,

        /// Concentration in the pollutant's canonical unit (µg/m³, ppb or ppm).
        #[arg(allow_negative_numbers = true)]
        concentration: f64,

        #[arg(long)]
        json: bool,
    },

    /// Show the current air quality forecast for a coordinate.
    Forecast {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        #[arg(long)]
        json: bool,
    },

    /// List configured sources and their fetch settings.
    Sources,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let path = match self.config {
            Some(path) => path,
            None => Config::config_file_path()?,
        };

        match self.command {
            Command::Configure { source } => configure(&path, source),
            Command::Calc { pollutant, concentration, json } => {
                let config = load(&path)?;
                let result = config.calculator()?.compute(pollutant, concentration)?;

                if json {
                    output::print_json(&output::calc_json(&result))
                } else {
                    println!("{}", output::calc_human(&result, concentration));
                    Ok(())
                }
            }
            Command::Forecast { lat, lon, json } => {
                let config = Arc::new(load(&path)?);
                let aggregator = ForecastAggregator::from_config(config)?;
                let forecast = aggregator
                    .aggregate(lat, lon)
                    .await
                    .with_context(|| format!("Failed to get air quality for {lat}, {lon}"))?;

                if json {
                    output::print_json(&forecast)
                } else {
                    println!("{}", output::ForecastReport(&forecast));
                    Ok(())
                }
            }
            Command::Sources => {
                let config = load(&path)?;
                println!("{}", output::SourcesReport(&config));
                Ok(())
            }
        }
    }
}

/// Config from `path` with environment credentials applied on top.
fn load(path: &std::path::Path) -> Result<Config> {
    tracing::debug!(path = %path.display(), "loading config");
    let mut config = Config::load_from(path)?;
    config.apply_env_overrides();
    Ok(config)
}

fn configure(path: &std::path::Path, source: SourceId) -> Result<()> {
    // env credentials are not written back to the file
    let mut config = Config::load_from(path)?;
    let current = config.source_config(source);

    println!("Configuring source: {source}");

    let enabled = Confirm::new("Enable this source?")
        .with_default(current.enabled)
        .prompt()?;
    config.set_source_enabled(source, enabled);

    let base_url = Text::new("Base URL:")
        .with_default(&current.base_url(source))
        .prompt()?;
    if base_url.trim_end_matches('/') != SourceConfig::default_base_url(source) {
        config.set_source_base_url(source, base_url);
    }

    let key_prompt = match source {
        SourceId::OpenMeteo => "API key (optional, leave empty for the free tier):",
        SourceId::OpenAq | SourceId::Tempo => "API key (leave empty to keep the current one):",
    };
    let api_key = Password::new(key_prompt)
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()?;
    if !api_key.trim().is_empty() {
        config.upsert_source_api_key(source, api_key.trim().to_string());
    }

    config.validate()?;
    config.save_to(path)?;
    println!("Saved configuration to {}", path.display());

    Ok(())
}
