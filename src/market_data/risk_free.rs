use async_trait::async_trait;
use serde::Deserialize;

use crate::error::DataError;

const FRED_OBSERVATIONS_URL: &str = "https://api.stlouisfed.org/fred/series/observations";

/// Source of the latest published value of a rate series, in percent.
#[async_trait]
pub trait RiskFreeRateSource: Send + Sync {
    async fn latest_percent(&self, series_id: &str) -> Result<f64, DataError>;
}

/// A constant rate, for running without a FRED key.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate {
    pub percent: f64,
}

#[async_trait]
impl RiskFreeRateSource for FixedRate {
    async fn latest_percent(&self, _series_id: &str) -> Result<f64, DataError> {
        Ok(self.percent)
    }
}

/// FRED (St. Louis Fed) series observations client.
pub struct FredClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Observations {
    observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct Observation {
    date: String,
    value: String,
}

impl FredClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: FRED_OBSERVATIONS_URL.to_string(),
        }
    }
}

/// Newest numeric observation. FRED marks missing values with ".".
fn latest_value(body: &str) -> Result<f64, DataError> {
    let parsed: Observations = serde_json::from_str(body)
        .map_err(|e| DataError::RiskFreeRate(format!("unexpected FRED response: {e}")))?;
    parsed
        .observations
        .iter()
        .rev()
        .find_map(|o| {
            let value = o.value.trim().parse::<f64>().ok()?;
            tracing::debug!("risk-free observation {} = {}", o.date, value);
            value.is_finite().then_some(value)
        })
        .ok_or_else(|| DataError::RiskFreeRate("series has no numeric observations".into()))
}

#[async_trait]
impl RiskFreeRateSource for FredClient {
    #[tracing::instrument(skip(self))]
    async fn latest_percent(&self, series_id: &str) -> Result<f64, DataError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("series_id", series_id),
                ("api_key", self.api_key.as_str()),
                ("file_type", "json"),
                ("sort_order", "asc"),
                ("observation_start", "2000-01-01"),
            ])
            .send()
            .await
            .map_err(|e| DataError::RiskFreeRate(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DataError::RiskFreeRate(e.to_string()))?;
        if !status.is_success() {
            return Err(DataError::RiskFreeRate(format!("FRED returned {status}")));
        }
        latest_value(&body)
    }
}
