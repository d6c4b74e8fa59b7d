use std::sync::Arc;

use time::Date;

use super::{MarketDataSource, Quote, RetryPolicy, Sleeper};
use crate::error::DataError;
use crate::series::{Price, PriceSeries};

/// Prices that could be fetched, plus the tickers that could not.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub series: PriceSeries,
    pub dropped: Vec<String>,
}

/// Fetches price history, tolerating flaky upstreams.
///
/// One batched request is made first. Any ticker it did not deliver gets its
/// own retry budget of single-ticker requests; a ticker that exhausts it is
/// dropped instead of failing the whole fetch.
pub struct PriceSeriesFetcher {
    source: Arc<dyn MarketDataSource>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

fn usable(ticker: &str, prices: Vec<Price>) -> Result<Vec<Price>, DataError> {
    if prices.iter().any(|p| p.value.is_finite() && p.value > 0.0) {
        Ok(prices)
    } else {
        Err(DataError::Empty {
            ticker: ticker.to_string(),
        })
    }
}

impl PriceSeriesFetcher {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            source,
            retry,
            sleeper,
        }
    }

    pub fn source(&self) -> &Arc<dyn MarketDataSource> {
        &self.source
    }

    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, tickers: &[String], start: Date, end: Date) -> FetchOutcome {
        let mut batch = self.source.get_history_batch(tickers, start, end).await;
        let mut outcome = FetchOutcome::default();

        for ticker in tickers {
            let first = batch
                .remove(ticker)
                .unwrap_or_else(|| {
                    Err(DataError::Empty {
                        ticker: ticker.clone(),
                    })
                })
                .and_then(|prices| usable(ticker, prices));

            let prices = match first {
                Ok(prices) => Ok(prices),
                Err(e) => {
                    tracing::debug!("batch fetch missed {ticker}: {e}");
                    self.fetch_one(ticker, start, end).await
                }
            };

            match prices {
                Ok(prices) => {
                    if !outcome.series.insert(ticker, prices) {
                        tracing::warn!("dropping {ticker}: no usable prices");
                        outcome.dropped.push(ticker.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping {ticker}: {e}");
                    outcome.dropped.push(ticker.clone());
                }
            }
        }
        outcome
    }

    /// Single-ticker fetch under the full retry budget.
    pub async fn fetch_one(
        &self,
        ticker: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<Price>, DataError> {
        self.retry
            .run(self.sleeper.as_ref(), ticker, |_| async move {
                let prices = self.source.get_history(ticker, start, end).await?;
                usable(ticker, prices)
            })
            .await
    }

    /// Current quote under the same retry budget as history requests.
    pub async fn quote(&self, ticker: &str) -> Result<Quote, DataError> {
        self.retry
            .run(self.sleeper.as_ref(), ticker, |_| async move {
                let quote = self.source.get_quote(ticker).await?;
                if quote.price.is_finite() && quote.price > 0.0 {
                    Ok(quote)
                } else {
                    Err(DataError::Quote {
                        ticker: ticker.to_string(),
                        message: format!("unusable price {}", quote.price),
                    })
                }
            })
            .await
    }
}
