use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::ConfigError;

/// A single adjusted-close observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub value: f64,
    pub date: Date,
}

/// Adjusted-close history for a set of tickers.
///
/// Each series is ordered by strictly increasing date. Gaps are kept as gaps:
/// nothing here fills missing trading days.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    tickers: Vec<String>,
    prices: HashMap<String, Vec<Price>>,
}

impl PriceSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ticker's history, dropping non-finite and non-positive prices and
    /// keeping the last observation for a repeated date.
    ///
    /// Returns `false` (and stores nothing) when no usable price remains.
    pub fn insert(&mut self, ticker: &str, mut prices: Vec<Price>) -> bool {
        prices.retain(|p| p.value.is_finite() && p.value > 0.0);
        // Stable sort so that "last wins" holds for duplicated dates.
        prices.sort_by_key(|p| p.date);
        let mut cleaned: Vec<Price> = Vec::with_capacity(prices.len());
        for p in prices {
            match cleaned.last_mut() {
                Some(last) if last.date == p.date => *last = p,
                _ => cleaned.push(p),
            }
        }
        if cleaned.is_empty() {
            return false;
        }

        if !self.prices.contains_key(ticker) {
            self.tickers.push(ticker.to_string());
        }
        let _ = self.prices.insert(ticker.to_string(), cleaned);
        true
    }

    /// Tickers in insertion order.
    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn get(&self, ticker: &str) -> Option<&[Price]> {
        self.prices.get(ticker).map(Vec::as_slice)
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.prices.contains_key(ticker)
    }

    pub fn latest(&self, ticker: &str) -> Option<Price> {
        self.get(ticker).and_then(|s| s.last().copied())
    }

    /// Copy of the series restricted to `keep`, in the order of `keep`.
    pub fn subset(&self, keep: &[String]) -> PriceSeries {
        let mut out = PriceSeries::new();
        for ticker in keep {
            if let Some(prices) = self.prices.get(ticker) {
                out.tickers.push(ticker.clone());
                let _ = out.prices.insert(ticker.clone(), prices.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

/// Normalise a user-entered symbol to its upper-case exchange form.
pub fn normalize_ticker(raw: &str) -> Result<String, ConfigError> {
    let ticker = raw.trim().to_uppercase();
    let valid = !ticker.is_empty()
        && ticker.len() <= 16
        && ticker
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if valid {
        Ok(ticker)
    } else {
        Err(ConfigError::InvalidTicker(raw.to_string()))
    }
}

/// Normalise a ticker list, rejecting empty lists and duplicates.
pub fn normalize_tickers<S: AsRef<str>>(raw: &[S]) -> Result<Vec<String>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::EmptyTickers);
    }
    let mut tickers: Vec<String> = Vec::with_capacity(raw.len());
    for r in raw {
        let t = normalize_ticker(r.as_ref())?;
        if tickers.contains(&t) {
            return Err(ConfigError::DuplicateTicker(t));
        }
        tickers.push(t);
    }
    Ok(tickers)
}
