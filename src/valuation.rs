//! Dollar valuation of holdings and gap filling of price data for display.
//!
//! Forward/backward filling happens only here. Series used for return
//! statistics are never filled.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::{NumericError, Result};
use crate::series::PriceSeries;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub ticker: String,
    pub share_count: f64,
    pub current_price: f64,
    pub previous_close: f64,
}

impl PortfolioPosition {
    pub fn market_value(&self) -> f64 {
        self.share_count * self.current_price
    }

    pub fn day_change_per_share(&self) -> f64 {
        self.current_price - self.previous_close
    }

    pub fn total_day_change(&self) -> f64 {
        self.day_change_per_share() * self.share_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub cash: f64,
    pub stock_value: f64,
    pub total_value: f64,
    pub day_change: f64,
    /// Day change as a percentage of total value; 0 when there is no value.
    pub day_change_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioValuation {
    pub positions: Vec<PortfolioPosition>,
    pub summary: PortfolioSummary,
}

impl PortfolioValuation {
    pub fn new(positions: Vec<PortfolioPosition>, cash: f64) -> Self {
        let stock_value: f64 = positions.iter().map(PortfolioPosition::market_value).sum();
        let day_change: f64 = positions
            .iter()
            .map(PortfolioPosition::total_day_change)
            .sum();
        let total_value = cash + stock_value;
        let day_change_pct = if total_value > 0.0 {
            day_change / total_value * 100.0
        } else {
            0.0
        };
        Self {
            positions,
            summary: PortfolioSummary {
                cash,
                stock_value,
                total_value,
                day_change,
                day_change_pct,
            },
        }
    }
}

/// Forward-fill then backward-fill non-finite gaps.
pub fn fill_gaps(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut filled: Vec<Option<f64>> = Vec::with_capacity(values.len());
    let mut last = None;
    for v in values {
        let v = v.filter(|x| x.is_finite());
        if v.is_some() {
            last = v;
        }
        filled.push(v.or(last));
    }
    let mut next = None;
    for v in filled.iter_mut().rev() {
        if v.is_some() {
            next = *v;
        } else {
            *v = next;
        }
    }
    filled
}

/// Latest usable price of an intraday close series, after filling gaps.
pub fn latest_price(closes: &[f64]) -> Option<f64> {
    let values: Vec<Option<f64>> = closes.iter().map(|c| Some(*c)).collect();
    fill_gaps(&values)
        .last()
        .copied()
        .flatten()
        .filter(|p| *p > 0.0)
}

/// Daily dollar value of fixed share counts, prices filled across gaps.
///
/// Tickers without any price are skipped; days with a non-positive total are
/// dropped.
pub fn value_series(prices: &PriceSeries, shares: &HashMap<String, f64>) -> Vec<(Date, f64)> {
    let dates: Vec<Date> = prices
        .tickers()
        .iter()
        .filter_map(|t| prices.get(t))
        .flat_map(|s| s.iter().map(|p| p.date))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut totals = vec![0.0; dates.len()];
    for ticker in prices.tickers() {
        let Some(count) = shares.get(ticker) else {
            continue;
        };
        let by_date: HashMap<Date, f64> = prices
            .get(ticker)
            .unwrap_or_default()
            .iter()
            .map(|p| (p.date, p.value))
            .collect();
        let aligned: Vec<Option<f64>> = dates.iter().map(|d| by_date.get(d).copied()).collect();
        for (total, price) in totals.iter_mut().zip(fill_gaps(&aligned)) {
            *total += count * price.unwrap_or(0.0);
        }
    }

    dates
        .into_iter()
        .zip(totals)
        .filter(|(_, v)| *v > 0.0)
        .collect()
}

/// Rescale a series so its first value is 100.
pub fn normalize(series: &[(Date, f64)]) -> Result<Vec<(Date, f64)>> {
    let base = match series.first() {
        Some((_, v)) if v.is_finite() && *v != 0.0 => *v,
        _ => return Err(NumericError::NonFinite("series base value").into()),
    };
    Ok(series.iter().map(|(d, v)| (*d, v / base * 100.0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Price;
    use time::macros::date;

    fn position(ticker: &str, shares: f64, price: f64, prev: f64) -> PortfolioPosition {
        PortfolioPosition {
            ticker: ticker.into(),
            share_count: shares,
            current_price: price,
            previous_close: prev,
        }
    }

    #[test]
    fn test_summary() {
        let valuation = PortfolioValuation::new(
            vec![
                position("AAPL", 10.0, 200.0, 190.0),
                position("MSFT", 2.0, 400.0, 410.0),
            ],
            200.0,
        );
        let s = valuation.summary;
        assert_eq!(s.stock_value, 2800.0);
        assert_eq!(s.total_value, 3000.0);
        assert_eq!(s.day_change, 100.0 - 20.0);
        assert!((s.day_change_pct - 80.0 / 3000.0 * 100.0).abs() < 1e-12);
        assert_eq!(valuation.positions[1].day_change_per_share(), -10.0);
    }

    #[test]
    fn test_empty_portfolio_has_zero_pct_change() {
        let s = PortfolioValuation::new(Vec::new(), 0.0).summary;
        assert_eq!(s.total_value, 0.0);
        assert_eq!(s.day_change_pct, 0.0);
    }

    #[test]
    fn test_fill_gaps() {
        let filled = fill_gaps(&[None, Some(1.0), Some(f64::NAN), None, Some(3.0), None]);
        assert_eq!(
            filled,
            vec![Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(3.0), Some(3.0)]
        );
        assert_eq!(fill_gaps(&[None, None]), vec![None, None]);
    }

    #[test]
    fn test_latest_price() {
        assert_eq!(latest_price(&[10.0, 11.0, f64::NAN]), Some(11.0));
        assert_eq!(latest_price(&[f64::NAN, f64::NAN]), None);
        assert_eq!(latest_price(&[]), None);
    }

    #[test]
    fn test_value_series_fills_and_normalizes() {
        let mut prices = PriceSeries::new();
        let _ = prices.insert(
            "A",
            vec![
                Price {
                    value: 10.0,
                    date: date!(2024 - 01 - 02),
                },
                Price {
                    value: 12.0,
                    date: date!(2024 - 01 - 04),
                },
            ],
        );
        let _ = prices.insert(
            "B",
            vec![
                Price {
                    value: 5.0,
                    date: date!(2024 - 01 - 03),
                },
                Price {
                    value: 6.0,
                    date: date!(2024 - 01 - 04),
                },
            ],
        );
        let shares: HashMap<String, f64> = [("A".to_string(), 2.0), ("B".to_string(), 4.0)]
            .into_iter()
            .collect();

        let series = value_series(&prices, &shares);
        // B is back-filled on the 2nd, A forward-filled on the 3rd.
        assert_eq!(
            series,
            vec![
                (date!(2024 - 01 - 02), 40.0),
                (date!(2024 - 01 - 03), 40.0),
                (date!(2024 - 01 - 04), 48.0),
            ]
        );

        let normalized = normalize(&series).unwrap();
        assert_eq!(normalized[0].1, 100.0);
        assert_eq!(normalized[2].1, 120.0);
        assert!(normalize(&[]).is_err());
    }
}
