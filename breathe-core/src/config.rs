use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, path::PathBuf, time::Duration};

use crate::aqi::{AqiCalculator, Breakpoint, BreakpointTable};
use crate::error::Error;
use crate::model::{Pollutant, SourceId, TimeWindow};
use crate::retry::{Backoff, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS, RetryPolicy};

/// Environment variables that override credentials from the config file.
pub const OPENAQ_API_KEY_ENV: &str = "OPENAQ_API_KEY";
pub const NASA_API_KEY_ENV: &str = "NASA_API_KEY";

const MAX_GEOLOCATION_PRECISION: u32 = 10;
const CLOCK_SKEW_MINUTES: i64 = 5;
const MAX_READING_AGE_SECS: u64 = 30 * 24 * 3600;
const MAX_ATTEMPTS: u32 = 10;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_BACKOFF_MS: u64 = 60_000;

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Settings for a single upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides the public endpoint, e.g. for a proxy or a test server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl SourceConfig {
    pub fn default_base_url(id: SourceId) -> &'static str {
        match id {
            SourceId::OpenAq => "https://api.openaq.org/v3",
            SourceId::Tempo => "https://api.nasa.gov/tempo",
            SourceId::OpenMeteo => "https://air-quality-api.open-meteo.com/v1",
        }
    }

    pub fn base_url(&self, id: SourceId) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(Self::default_base_url(id))
            .trim_end_matches('/')
            .to_string()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.timeout_secs), self.max_attempts, self.backoff)
    }
}

/// Cache lifetimes. Ground and satellite readings share one TTL; the weather
/// model has its own, shorter one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub air_quality_ttl_secs: u64,
    pub weather_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            air_quality_ttl_secs: 3600,
            weather_ttl_secs: 1800,
        }
    }
}

/// Override of a pollutant's breakpoint table.
///
/// Example TOML:
/// [breakpoints.pm25]
/// precision = 1
/// rows = [[0.0, 12.0, 0, 50], [12.1, 35.4, 51, 100]]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub precision: u32,
    pub rows: Vec<(f64, f64, u16, u16)>,
}

/// Top-level configuration stored on disk. Built once at startup and shared
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Decimal places coordinates are rounded to before lookup and caching.
    pub geolocation_precision: u32,

    pub default_search_radius_km: f64,
    pub max_search_radius_km: f64,

    /// Readings observed longer ago than this are ignored.
    pub max_reading_age_secs: u64,

    pub required_pollutants: Vec<Pollutant>,

    pub cache: CacheConfig,

    /// Example TOML:
    /// [sources.openaq]
    /// api_key = "..."
    /// timeout_secs = 5
    pub sources: HashMap<String, SourceConfig>,

    pub breakpoints: HashMap<String, TableConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            geolocation_precision: 6,
            default_search_radius_km: 10.0,
            max_search_radius_km: 100.0,
            max_reading_age_secs: 3 * 3600,
            required_pollutants: vec![Pollutant::Pm25, Pollutant::No2, Pollutant::O3],
            cache: CacheConfig::default(),
            sources: HashMap::new(),
            breakpoints: HashMap::new(),
        }
    }
}

impl Config {
    /// Effective settings for a source: the configured entry, or defaults.
    pub fn source_config(&self, id: SourceId) -> SourceConfig {
        self.sources.get(id.as_str()).cloned().unwrap_or_default()
    }

    pub fn is_source_enabled(&self, id: SourceId) -> bool {
        self.sources.get(id.as_str()).is_none_or(|cfg| cfg.enabled)
    }

    pub fn enabled_sources(&self) -> Vec<SourceId> {
        SourceId::all()
            .iter()
            .copied()
            .filter(|id| self.is_source_enabled(*id))
            .collect()
    }

    /// Returns API key for a source, if present.
    pub fn source_api_key(&self, id: SourceId) -> Option<&str> {
        self.sources.get(id.as_str()).and_then(|cfg| cfg.api_key.as_deref())
    }

    /// Convenience helper: set/replace a source API key.
    pub fn upsert_source_api_key(&mut self, id: SourceId, api_key: String) {
        self.sources.entry(id.as_str().to_string()).or_default().api_key = Some(api_key);
    }

    pub fn set_source_base_url(&mut self, id: SourceId, base_url: String) {
        self.sources.entry(id.as_str().to_string()).or_default().base_url = Some(base_url);
    }

    pub fn set_source_enabled(&mut self, id: SourceId, enabled: bool) {
        self.sources.entry(id.as_str().to_string()).or_default().enabled = enabled;
    }

    /// Cache lifetime for readings from `id`.
    pub fn ttl_for(&self, id: SourceId) -> Duration {
        let secs = match id {
            SourceId::OpenAq | SourceId::Tempo => self.cache.air_quality_ttl_secs,
            SourceId::OpenMeteo => self.cache.weather_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn search_radius_km(&self) -> f64 {
        self.default_search_radius_km.min(self.max_search_radius_km)
    }

    /// Window of acceptable observation times for a request made at `now`.
    pub fn reading_window(&self, now: DateTime<Utc>) -> TimeWindow {
        let secs = i64::try_from(self.max_reading_age_secs).unwrap_or(i64::MAX / 1000);
        let max_age = chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::days(365));
        // upstream clocks may run slightly ahead of ours
        let end = now
            .checked_add_signed(chrono::Duration::minutes(CLOCK_SKEW_MINUTES))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let start = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        TimeWindow { start, end }
    }

    /// AQI calculator with the standard tables plus any configured overrides.
    pub fn calculator(&self) -> Result<AqiCalculator, Error> {
        let mut calculator = AqiCalculator::epa();

        for (name, table) in &self.breakpoints {
            let pollutant = Pollutant::try_from(name.as_str())
                .map_err(|e| Error::Config(format!("breakpoints.{name}: {e}")))?;
            let rows = table
                .rows
                .iter()
                .map(|&(c_lo, c_hi, i_lo, i_hi)| Breakpoint::new(c_lo, c_hi, i_lo, i_hi))
                .collect();
            calculator = calculator.with_table(BreakpointTable::new(pollutant, table.precision, rows)?);
        }

        Ok(calculator)
    }

    /// Check every setting that would otherwise fail at request time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.geolocation_precision > MAX_GEOLOCATION_PRECISION {
            return Err(Error::Config(format!(
                "geolocation_precision must be at most {MAX_GEOLOCATION_PRECISION}, got {}",
                self.geolocation_precision
            )));
        }

        if !(self.default_search_radius_km > 0.0 && self.max_search_radius_km > 0.0) {
            return Err(Error::Config("search radius must be positive".to_string()));
        }

        if !(1..=MAX_READING_AGE_SECS).contains(&self.max_reading_age_secs) {
            return Err(Error::Config(format!(
                "max_reading_age_secs must be between 1 and {MAX_READING_AGE_SECS}, got {}",
                self.max_reading_age_secs
            )));
        }

        if self.required_pollutants.is_empty() {
            return Err(Error::Config("required_pollutants must not be empty".to_string()));
        }

        for (name, source) in &self.sources {
            SourceId::try_from(name.as_str())
                .map_err(|e| Error::Config(format!("sources.{name}: {e}")))?;
            if !(1..=MAX_ATTEMPTS).contains(&source.max_attempts) {
                return Err(Error::Config(format!(
                    "sources.{name}.max_attempts must be between 1 and {MAX_ATTEMPTS}"
                )));
            }
            if !(1..=MAX_TIMEOUT_SECS).contains(&source.timeout_secs) {
                return Err(Error::Config(format!(
                    "sources.{name}.timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}"
                )));
            }
            // delays never shrink, so the last one is the longest
            let longest_delay = source.backoff.delay_for_retry(source.max_attempts.saturating_sub(2));
            if longest_delay > Duration::from_millis(MAX_BACKOFF_MS) {
                return Err(Error::Config(format!(
                    "sources.{name}.backoff delays must not exceed {MAX_BACKOFF_MS} ms"
                )));
            }
        }

        self.calculator().map(|_| ())
    }

    /// Apply credentials from the environment on top of the file contents.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides = [(OPENAQ_API_KEY_ENV, SourceId::OpenAq), (NASA_API_KEY_ENV, SourceId::Tempo)];

        for (var, id) in overrides {
            if let Some(key) = lookup(var).filter(|k| !k.trim().is_empty()) {
                self.upsert_source_api_key(id, key);
            }
        }
    }

    /// Load config from disk, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("app", "breatheprint", "breathe")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.enabled_sources(), SourceId::all().to_vec());
        assert_eq!(cfg.ttl_for(SourceId::OpenAq), Duration::from_secs(3600));
        assert_eq!(cfg.ttl_for(SourceId::OpenMeteo), Duration::from_secs(1800));
    }

    #[test]
    fn source_config_falls_back_to_defaults() {
        let cfg = Config::default();
        let src = cfg.source_config(SourceId::Tempo);
        assert_eq!(src.base_url(SourceId::Tempo), "https://api.nasa.gov/tempo");
        assert_eq!(src.retry_policy().max_attempts, 3);
        assert_eq!(src.retry_policy().timeout, Duration::from_secs(10));
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let mut cfg = Config::default();
        cfg.set_source_base_url(SourceId::OpenAq, "http://127.0.0.1:9000/".into());
        assert_eq!(
            cfg.source_config(SourceId::OpenAq).base_url(SourceId::OpenAq),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn upsert_api_key_creates_source_entry() {
        let mut cfg = Config::default();
        cfg.upsert_source_api_key(SourceId::OpenAq, "OPEN_KEY".into());

        assert_eq!(cfg.source_api_key(SourceId::OpenAq), Some("OPEN_KEY"));
        assert_eq!(cfg.source_api_key(SourceId::Tempo), None);
        assert!(cfg.is_source_enabled(SourceId::OpenAq));
    }

    #[test]
    fn disabled_source_is_skipped() {
        let mut cfg = Config::default();
        cfg.set_source_enabled(SourceId::Tempo, false);
        assert_eq!(cfg.enabled_sources(), vec![SourceId::OpenAq, SourceId::OpenMeteo]);
    }

    #[test]
    fn env_overrides_fill_api_keys() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(|key| match key {
            NASA_API_KEY_ENV => Some("nasa".to_string()),
            OPENAQ_API_KEY_ENV => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(cfg.source_api_key(SourceId::Tempo), Some("nasa"));
        assert_eq!(cfg.source_api_key(SourceId::OpenAq), None);
    }

    #[test]
    fn parses_toml_with_sources_and_tables() {
        let toml = r#"
            geolocation_precision = 3
            required_pollutants = ["pm25", "o3"]

            [cache]
            weather_ttl_secs = 600

            [sources.openaq]
            api_key = "KEY"
            timeout_secs = 5
            max_attempts = 2
            backoff = { kind = "fixed", delay_ms = 100 }

            [sources.tempo]
            enabled = false

            [breakpoints.pm25]
            precision = 0
            rows = [[0, 10, 0, 50], [11, 20, 51, 100]]
        "#;

        let cfg: Config = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.geolocation_precision, 3);
        assert_eq!(cfg.required_pollutants, vec![Pollutant::Pm25, Pollutant::O3]);
        assert_eq!(cfg.cache.weather_ttl_secs, 600);
        assert_eq!(cfg.cache.air_quality_ttl_secs, 3600);

        let policy = cfg.source_config(SourceId::OpenAq).retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.backoff, Backoff::Fixed { delay_ms: 100 });
        assert!(!cfg.is_source_enabled(SourceId::Tempo));

        let calc = cfg.calculator().unwrap();
        assert_eq!(calc.compute(Pollutant::Pm25, 20.0).unwrap().index, 100);
    }

    #[test]
    fn rejects_invalid_settings() {
        let mut cfg = Config { geolocation_precision: 11, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg = Config::default();
        cfg.sources.insert(
            "openaq".into(),
            SourceConfig { max_attempts: 0, ..SourceConfig::default() },
        );
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg = Config::default();
        cfg.sources.insert("purpleair".into(), SourceConfig::default());
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg = Config::default();
        cfg.breakpoints.insert(
            "pm25".into(),
            TableConfig { precision: 1, rows: vec![(0.0, 12.0, 0, 50), (13.0, 20.0, 51, 100)] },
        );
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_ages_and_retry_settings() {
        let cfg = Config { max_reading_age_secs: u64::MAX, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = Config { max_reading_age_secs: 0, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let too_many = SourceConfig { max_attempts: u32::MAX, ..SourceConfig::default() };
        let too_slow = SourceConfig { timeout_secs: u64::MAX, ..SourceConfig::default() };
        // ninth retry would sleep 256 s
        let long_sleep = SourceConfig {
            max_attempts: 10,
            backoff: Backoff::Exponential { initial_ms: 1000, max_ms: u64::MAX },
            ..SourceConfig::default()
        };
        let fixed_sleep = SourceConfig {
            backoff: Backoff::Fixed { delay_ms: u64::MAX },
            ..SourceConfig::default()
        };

        for source in [too_many, too_slow, long_sleep, fixed_sleep] {
            let mut cfg = Config::default();
            cfg.sources.insert("openaq".into(), source);
            assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn large_backoff_cap_is_fine_when_never_reached() {
        // 3 attempts sleep at most 250 ms then 500 ms
        let mut cfg = Config::default();
        cfg.sources.insert(
            "openaq".into(),
            SourceConfig {
                backoff: Backoff::Exponential { initial_ms: 250, max_ms: u64::MAX },
                ..SourceConfig::default()
            },
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn reading_window_never_overflows() {
        let cfg = Config { max_reading_age_secs: u64::MAX, ..Config::default() };
        let now = Utc::now();
        let window = cfg.reading_window(now);

        assert!(window.contains(now));
        assert!(window.start < now);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.upsert_source_api_key(SourceId::OpenAq, "KEY".into());
        cfg.cache.weather_ttl_secs = 900;
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
