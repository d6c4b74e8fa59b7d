use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_SETTINGS_PATH: &str = "dashboard.yaml";

/// Everything tunable from the YAML settings file. Each section falls back to
/// its defaults when left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retry: RetrySettings,
    pub optimizer: OptimizerSettings,
    pub risk: RiskSettings,
    pub risk_free: RiskFreeSettings,
    pub benchmark: BenchmarkSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: BackoffKind,
    /// Ceiling for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 500,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 8_000,
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub max_iterations: usize,
    /// Largest projected-gradient step, relative to the largest gradient
    /// component (at least 1), still counted as stationary.
    pub tolerance: f64,
    pub max_tickers: usize,
    /// Shortest history (calendar days) an optimisation may run on.
    pub min_history_days: i64,
    pub max_history_years: i32,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 2_000,
            tolerance: 1e-9,
            max_tickers: 50,
            min_history_days: 31,
            max_history_years: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub lookback_years: i64,
    pub default_window_days: usize,
    pub default_confidence: f64,
    /// How far back to look for a last price when the quote feed fails.
    pub latest_price_lookback_days: i64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            lookback_years: 10,
            default_window_days: 5,
            default_confidence: 95.0,
            latest_price_lookback_days: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskFreeSettings {
    pub series_id: String,
    /// Annual rate as a fraction, used when no FRED key is configured.
    pub fallback_rate: Option<f64>,
}

impl Default for RiskFreeSettings {
    fn default() -> Self {
        Self {
            series_id: "GS10".to_string(),
            fallback_rate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    pub ticker: String,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            ticker: "^GSPC".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                tracing::info!("no settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Settings(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::Settings(format!("failed to parse YAML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.optimizer.max_iterations == 0 || self.optimizer.max_tickers == 0 {
            return Err(ConfigError::Settings(
                "optimizer limits must be positive".into(),
            ));
        }
        if !(self.optimizer.tolerance > 0.0) {
            return Err(ConfigError::Settings(
                "optimizer.tolerance must be positive".into(),
            ));
        }
        if self.risk.lookback_years <= 0 {
            return Err(ConfigError::Settings(
                "risk.lookback_years must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Credentials read from the environment (and `.env`, when present).
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub fred_api_key: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            fred_api_key: var("FRED_API_KEY"),
            supabase_url: var("SUPABASE_URL"),
            supabase_key: var("SUPABASE_KEY"),
        }
    }

    pub fn supabase(&self) -> Result<Option<(String, String)>, ConfigError> {
        match (&self.supabase_url, &self.supabase_key) {
            (None, _) => Ok(None),
            (Some(_), None) => Err(ConfigError::MissingSecret("SUPABASE_KEY")),
            (Some(url), Some(key)) => Ok(Some((url.clone(), key.clone()))),
        }
    }
}
