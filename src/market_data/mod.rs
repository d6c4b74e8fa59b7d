//! Market-data collaborators and the retrying price fetcher built on them.

mod fetcher;
mod retry;
mod risk_free;
mod yahoo;

pub use fetcher::{FetchOutcome, PriceSeriesFetcher};
pub use retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};
pub use risk_free::{FixedRate, FredClient, RiskFreeRateSource};
pub use yahoo::YahooSource;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::DataError;
use crate::series::Price;

/// Current price and previous session close for one ticker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub previous_close: f64,
}

/// Source of prices. Any call may fail transiently.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Daily adjusted closes for `ticker` between `start` and `end` inclusive,
    /// ordered by date.
    async fn get_history(&self, ticker: &str, start: Date, end: Date)
        -> Result<Vec<Price>, DataError>;

    /// Batched form of [`get_history`](Self::get_history). Sources without a
    /// native batch call fall back to one request per ticker.
    async fn get_history_batch(
        &self,
        tickers: &[String],
        start: Date,
        end: Date,
    ) -> HashMap<String, Result<Vec<Price>, DataError>> {
        let mut out = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            let result = self.get_history(ticker, start, end).await;
            let _ = out.insert(ticker.clone(), result);
        }
        out
    }

    /// Recent intraday closes, oldest first. Gaps show up as NaN.
    async fn get_recent_closes(&self, ticker: &str) -> Result<Vec<f64>, DataError>;

    async fn get_quote(&self, ticker: &str) -> Result<Quote, DataError>;
}
