use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use yahoo_finance_api as yahoo;

use super::{MarketDataSource, Quote};
use crate::error::DataError;
use crate::series::Price;

/// Yahoo Finance backed [`MarketDataSource`].
pub struct YahooSource {
    provider: yahoo::YahooConnector,
}

impl YahooSource {
    pub fn new() -> Result<Self, DataError> {
        let provider = yahoo::YahooConnector::new().map_err(|e| DataError::Provider {
            ticker: String::new(),
            message: format!("failed to initialise Yahoo connector: {e}"),
        })?;
        Ok(Self { provider })
    }
}

fn provider_error(ticker: &str, e: yahoo::YahooError) -> DataError {
    match e {
        yahoo::YahooError::EmptyDataSet | yahoo::YahooError::DataInconsistency => {
            DataError::Empty {
                ticker: ticker.to_string(),
            }
        }
        e => DataError::Provider {
            ticker: ticker.to_string(),
            message: e.to_string(),
        },
    }
}

fn quote_date(timestamp: i64) -> Option<Date> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .map(|dt| dt.date())
}

#[async_trait]
impl MarketDataSource for YahooSource {
    #[tracing::instrument(skip(self))]
    async fn get_history(
        &self,
        ticker: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<Price>, DataError> {
        let start = start.midnight().assume_utc();
        // Yahoo treats the end bound as exclusive.
        let end = end.next_day().unwrap_or(end).midnight().assume_utc();

        let response = self
            .provider
            .get_quote_history(ticker, start, end)
            .await
            .map_err(|e| provider_error(ticker, e))?;
        let quotes = response.quotes().map_err(|e| provider_error(ticker, e))?;

        let prices: Vec<Price> = quotes
            .iter()
            .filter_map(|q| {
                Some(Price {
                    value: q.adjclose,
                    date: quote_date(q.timestamp as i64)?,
                })
            })
            .collect();
        tracing::debug!("fetched {} prices for {}", prices.len(), ticker);
        Ok(prices)
    }

    async fn get_recent_closes(&self, ticker: &str) -> Result<Vec<f64>, DataError> {
        let response = self
            .provider
            .get_quote_range(ticker, "5m", "5d")
            .await
            .map_err(|e| provider_error(ticker, e))?;
        let quotes = response.quotes().map_err(|e| provider_error(ticker, e))?;
        Ok(quotes.iter().map(|q| q.close).collect())
    }

    async fn get_quote(&self, ticker: &str) -> Result<Quote, DataError> {
        let response = self
            .provider
            .get_quote_range(ticker, "1d", "5d")
            .await
            .map_err(|e| provider_error(ticker, e))?;
        let closes: Vec<f64> = response
            .quotes()
            .map_err(|e| provider_error(ticker, e))?
            .iter()
            .map(|q| q.close)
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();

        match closes.as_slice() {
            [.., previous_close, price] => Ok(Quote {
                price: *price,
                previous_close: *previous_close,
            }),
            _ => Err(DataError::Quote {
                ticker: ticker.to_string(),
                message: "fewer than two daily closes available".into(),
            }),
        }
    }
}
