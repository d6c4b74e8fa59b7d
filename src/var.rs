//! Historical Value at Risk from rolling sums of daily log returns.

use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, NumericError, Result};
use crate::stats::ReturnMatrix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaRResult {
    pub window_days: usize,
    pub confidence_level: f64,
    /// Loss magnitude in dollars; positive means a loss.
    pub value_at_risk: f64,
    /// Dollar P&L of every complete window, in date order.
    pub return_distribution: Vec<f64>,
    pub portfolio_value: f64,
    /// Market-value weight of each ticker, in input order.
    pub value_weights: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoricalVaREstimator;

impl HistoricalVaREstimator {
    pub fn new() -> Self {
        Self
    }

    /// Estimate `window_days`-day VaR at `confidence` percent.
    ///
    /// Static composition assumption: today's holdings and notional value are
    /// applied to every historical window, as if the portfolio had held the
    /// same value weights throughout the lookback.
    ///
    /// The value weight of a ticker is `shares * latest_price / notional`,
    /// which is unrelated to any optimiser weight. Every ticker needs both a
    /// latest price and a return column.
    #[tracing::instrument(skip(self, shares, returns, latest_prices))]
    pub fn estimate(
        &self,
        tickers: &[String],
        shares: &HashMap<String, f64>,
        returns: &ReturnMatrix,
        latest_prices: &HashMap<String, f64>,
        window_days: usize,
        confidence: f64,
    ) -> Result<VaRResult> {
        if tickers.is_empty() {
            return Err(ConfigError::EmptyTickers.into());
        }
        if !(confidence > 0.0 && confidence < 100.0) {
            return Err(ConfigError::ConfidenceOutOfRange(confidence).into());
        }
        let max_window = returns.observations().saturating_sub(1);
        if window_days == 0 || window_days > max_window {
            return Err(ConfigError::WindowOutOfRange {
                window: window_days,
                max: max_window,
            }
            .into());
        }

        let mut positions = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            let price = *latest_prices
                .get(ticker)
                .filter(|p| p.is_finite() && **p > 0.0)
                .ok_or_else(|| ConfigError::MissingPrice(ticker.clone()))?;
            let count = shares.get(ticker).copied().unwrap_or(0.0);
            if !(count.is_finite() && count >= 0.0) {
                return Err(ConfigError::InvalidShares(count).into());
            }
            let column = returns
                .index_of(ticker)
                .ok_or_else(|| ConfigError::MissingReturns(ticker.clone()))?;
            positions.push((column, count * price));
        }

        let portfolio_value: f64 = positions.iter().map(|(_, value)| value).sum();
        if portfolio_value <= 0.0 {
            return Err(ConfigError::ZeroNotional.into());
        }
        let value_weights: Vec<f64> = positions
            .iter()
            .map(|(_, value)| value / portfolio_value)
            .collect();

        let mut blend = DVector::zeros(returns.tickers().len());
        for ((column, _), weight) in positions.iter().zip(&value_weights) {
            blend[*column] += weight;
        }
        let daily = returns.values() * blend;

        let return_distribution: Vec<f64> = rolling_sums(daily.as_slice(), window_days)
            .into_iter()
            .map(|log_return| log_return.exp_m1() * portfolio_value)
            .collect();
        if return_distribution.iter().any(|pnl| !pnl.is_finite()) {
            return Err(NumericError::NonFinite("P&L distribution").into());
        }

        let value_at_risk = -percentile(&return_distribution, 100.0 - confidence);
        tracing::debug!(value_at_risk, samples = return_distribution.len(), "VaR estimated");

        Ok(VaRResult {
            window_days,
            confidence_level: confidence,
            // Avoid reporting -0.0 for a flat distribution.
            value_at_risk: value_at_risk + 0.0,
            return_distribution,
            portfolio_value,
            value_weights,
        })
    }
}

/// Trailing sums over `window` consecutive values; incomplete leading windows
/// are skipped.
pub fn rolling_sums(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 {
        return Vec::new();
    }
    values.windows(window).map(|w| w.iter().sum()).collect()
}

/// Empirical percentile with linear interpolation between closest ranks.
///
/// `pct` is in `[0, 100]`. Returns NaN for an empty sample.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use time::macros::date;

    fn matrix(columns: &[(&str, Vec<f64>)]) -> ReturnMatrix {
        let len = columns[0].1.len();
        ReturnMatrix::from_columns(
            columns.iter().map(|(t, _)| t.to_string()).collect(),
            (0..len)
                .map(|i| date!(2023 - 01 - 01) + time::Duration::days(i as i64))
                .collect(),
            &columns.iter().map(|(_, c)| c.clone()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    fn holdings(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(t, v)| (t.to_string(), *v)).collect()
    }

    #[test]
    fn test_flat_history_has_zero_var() {
        let returns = matrix(&[("FLAT", vec![0.0; 30])]);
        let tickers = vec!["FLAT".to_string()];
        let shares = holdings(&[("FLAT", 10.0)]);
        let prices = holdings(&[("FLAT", 50.0)]);

        for confidence in [70.0, 95.0, 99.9] {
            let result = HistoricalVaREstimator::new()
                .estimate(&tickers, &shares, &returns, &prices, 5, confidence)
                .unwrap();
            assert_eq!(result.return_distribution.len(), 26);
            assert!(result.return_distribution.iter().all(|pnl| *pnl == 0.0));
            assert_eq!(result.value_at_risk, 0.0);
            assert_eq!(result.portfolio_value, 500.0);
        }
    }

    #[test]
    fn test_known_distribution() {
        // One-day windows over 0.00, -0.01, ..., -0.09 log returns.
        let daily: Vec<f64> = (0..10).map(|i| -0.01 * i as f64).collect();
        let returns = matrix(&[("X", daily.clone())]);
        let tickers = vec!["X".to_string()];
        let shares = holdings(&[("X", 1.0)]);
        let prices = holdings(&[("X", 1000.0)]);

        let result = HistoricalVaREstimator::new()
            .estimate(&tickers, &shares, &returns, &prices, 1, 90.0)
            .unwrap();

        let pnl: Vec<f64> = daily.iter().map(|r| r.exp_m1() * 1000.0).collect();
        assert_eq!(result.return_distribution, pnl);
        // 10th percentile of 10 sorted samples sits at rank 0.9.
        let mut sorted = pnl.clone();
        sorted.sort_by(f64::total_cmp);
        let expected = -(sorted[0] + (sorted[1] - sorted[0]) * 0.9);
        assert!((result.value_at_risk - expected).abs() < 1e-9);
        assert!(result.value_at_risk > 0.0);
    }

    #[test]
    fn test_value_weights_blend_returns() {
        let returns = matrix(&[
            ("A", vec![0.01, 0.02, -0.01, 0.0]),
            ("B", vec![-0.02, 0.0, 0.03, 0.01]),
        ]);
        let tickers = vec!["B".to_string(), "A".to_string()];
        let shares = holdings(&[("A", 3.0), ("B", 1.0)]);
        let prices = holdings(&[("A", 100.0), ("B", 100.0)]);

        let result = HistoricalVaREstimator::new()
            .estimate(&tickers, &shares, &returns, &prices, 1, 95.0)
            .unwrap();

        assert_eq!(result.value_weights, vec![0.25, 0.75]);
        let first: f64 = 0.75 * 0.01 + 0.25 * -0.02;
        assert!((result.return_distribution[0] - first.exp_m1() * 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_static_composition_uses_current_notional() {
        // Same history, twice the holdings: the P&L scales with today's value.
        let returns = matrix(&[("A", vec![0.01, -0.03, 0.02, -0.01, 0.005])]);
        let tickers = vec!["A".to_string()];
        let prices = holdings(&[("A", 20.0)]);

        let small = HistoricalVaREstimator::new()
            .estimate(&tickers, &holdings(&[("A", 5.0)]), &returns, &prices, 2, 95.0)
            .unwrap();
        let large = HistoricalVaREstimator::new()
            .estimate(&tickers, &holdings(&[("A", 10.0)]), &returns, &prices, 2, 95.0)
            .unwrap();
        assert!((large.value_at_risk - 2.0 * small.value_at_risk).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let returns = matrix(&[("A", vec![0.01, -0.02, 0.0, 0.01])]);
        let tickers = vec!["A".to_string()];
        let shares = holdings(&[("A", 1.0)]);
        let prices = holdings(&[("A", 10.0)]);
        let estimator = HistoricalVaREstimator::new();

        for confidence in [0.0, 100.0, -5.0, 150.0, f64::NAN] {
            assert!(matches!(
                estimator.estimate(&tickers, &shares, &returns, &prices, 1, confidence),
                Err(Error::Config(ConfigError::ConfidenceOutOfRange(_)))
            ));
        }
        for window in [0, 4, 10] {
            assert!(matches!(
                estimator.estimate(&tickers, &shares, &returns, &prices, window, 95.0),
                Err(Error::Config(ConfigError::WindowOutOfRange { max: 3, .. }))
            ));
        }
        assert!(matches!(
            estimator.estimate(&tickers, &shares, &returns, &HashMap::new(), 1, 95.0),
            Err(Error::Config(ConfigError::MissingPrice(t))) if t == "A"
        ));
        assert!(matches!(
            estimator.estimate(&tickers, &holdings(&[("A", 0.0)]), &returns, &prices, 1, 95.0),
            Err(Error::Config(ConfigError::ZeroNotional))
        ));
        let unknown = vec!["Z".to_string()];
        let z_prices = holdings(&[("Z", 1.0)]);
        assert!(matches!(
            estimator.estimate(&unknown, &z_prices, &returns, &z_prices, 1, 95.0),
            Err(Error::Config(ConfigError::MissingReturns(t))) if t == "Z"
        ));
    }

    #[test]
    fn test_percentile_interpolates() {
        let sample = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(&sample, 0.0), 1.0);
        assert_eq!(percentile(&sample, 100.0), 5.0);
        assert_eq!(percentile(&sample, 50.0), 3.0);
        assert!((percentile(&sample, 5.0) - 1.2).abs() < 1e-12);
        assert!(percentile(&[], 5.0).is_nan());
    }

    #[test]
    fn test_rolling_sums() {
        assert_eq!(rolling_sums(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 5.0, 7.0]);
        assert!(rolling_sums(&[1.0], 2).is_empty());
    }
}
