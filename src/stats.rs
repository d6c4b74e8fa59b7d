use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};
use time::Date;

use crate::error::{ConfigError, NumericError, Result};
use crate::series::PriceSeries;

/// Trading days per year used to annualise daily statistics.
pub const TRADING_DAYS: f64 = 252.0;

/// Daily log returns aligned on common dates.
///
/// Rows are dates (ascending), columns are tickers in input order. No cell is
/// ever missing: rows where any ticker lacks a return are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnMatrix {
    tickers: Vec<String>,
    dates: Vec<Date>,
    values: DMatrix<f64>,
}

impl ReturnMatrix {
    /// Build from per-ticker return columns of equal length.
    pub fn from_columns(
        tickers: Vec<String>,
        dates: Vec<Date>,
        columns: &[Vec<f64>],
    ) -> Result<Self> {
        if columns.len() != tickers.len() {
            return Err(ConfigError::DimensionMismatch {
                expected: tickers.len(),
                actual: columns.len(),
            }
            .into());
        }
        for column in columns {
            if column.len() != dates.len() {
                return Err(ConfigError::DimensionMismatch {
                    expected: dates.len(),
                    actual: column.len(),
                }
                .into());
            }
            if column.iter().any(|r| !r.is_finite()) {
                return Err(NumericError::NonFinite("return series").into());
            }
        }
        let values = DMatrix::from_fn(dates.len(), tickers.len(), |i, j| columns[j][i]);
        Ok(Self {
            tickers,
            dates,
            values,
        })
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn dates(&self) -> &[Date] {
        &self.dates
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn observations(&self) -> usize {
        self.values.nrows()
    }

    pub fn index_of(&self, ticker: &str) -> Option<usize> {
        self.tickers.iter().position(|t| t == ticker)
    }

    pub fn column(&self, ticker: &str) -> Option<Vec<f64>> {
        self.index_of(ticker)
            .map(|j| self.values.column(j).iter().copied().collect())
    }

    /// Column-wise mean of the daily log returns.
    pub fn mean_daily(&self) -> DVector<f64> {
        let n = self.observations().max(1) as f64;
        DVector::from_iterator(
            self.values.ncols(),
            self.values.column_iter().map(|c| c.sum() / n),
        )
    }
}

/// Annualised sample covariance of a [`ReturnMatrix`].
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    tickers: Vec<String>,
    matrix: DMatrix<f64>,
    observations: usize,
}

impl CovarianceMatrix {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// With fewer observations than assets the sample covariance is rank
    /// deficient. Such a matrix is reported here but never regularised.
    pub fn is_singular(&self) -> bool {
        self.observations <= self.matrix.nrows() || self.matrix.clone().cholesky().is_none()
    }
}

/// Log returns of every ticker, inner-joined on date.
///
/// Prices are laid out on the union of all dates first; a ticker's return on a
/// row exists only when it has a price on that row and the previous one.
pub fn log_returns(prices: &PriceSeries) -> ReturnMatrix {
    let tickers: Vec<String> = prices.tickers().to_vec();
    let all_dates: Vec<Date> = tickers
        .iter()
        .filter_map(|t| prices.get(t))
        .flat_map(|s| s.iter().map(|p| p.date))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let lookup: Vec<HashMap<Date, f64>> = tickers
        .iter()
        .map(|t| {
            prices
                .get(t)
                .unwrap_or_default()
                .iter()
                .map(|p| (p.date, p.value))
                .collect()
        })
        .collect();

    let mut dates = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for w in all_dates.windows(2) {
        let row: Option<Vec<f64>> = lookup
            .iter()
            .map(|by_date| {
                let prev = by_date.get(&w[0])?;
                let cur = by_date.get(&w[1])?;
                Some((cur / prev).ln())
            })
            .collect();
        if let Some(row) = row {
            dates.push(w[1]);
            rows.push(row);
        }
    }

    let values = DMatrix::from_fn(rows.len(), tickers.len(), |i, j| rows[i][j]);
    ReturnMatrix {
        tickers,
        dates,
        values,
    }
}

/// Sample covariance (n - 1 denominator) scaled by [`TRADING_DAYS`].
pub fn covariance(returns: &ReturnMatrix) -> Result<CovarianceMatrix> {
    let n = returns.observations();
    if n < 2 {
        return Err(NumericError::InsufficientObservations {
            observations: n,
            required: 2,
        }
        .into());
    }
    let mean = returns.mean_daily();
    let mut centered = returns.values.clone();
    for (j, mut column) in centered.column_iter_mut().enumerate() {
        column.add_scalar_mut(-mean[j]);
    }
    let matrix = (centered.transpose() * &centered) * (TRADING_DAYS / (n as f64 - 1.0));

    Ok(CovarianceMatrix {
        tickers: returns.tickers.clone(),
        matrix,
        observations: n,
    })
}

fn check_len(weights: &DVector<f64>, expected: usize) -> Result<()> {
    if weights.len() != expected {
        return Err(ConfigError::DimensionMismatch {
            expected,
            actual: weights.len(),
        }
        .into());
    }
    Ok(())
}

/// Annualised expected return: `w . mean(daily log returns) * 252`.
///
/// This is the arithmetic mean of log returns scaled linearly, an
/// approximation that ignores compounding.
pub fn expected_return(weights: &DVector<f64>, returns: &ReturnMatrix) -> Result<f64> {
    check_len(weights, returns.tickers.len())?;
    Ok(weights.dot(&returns.mean_daily()) * TRADING_DAYS)
}

/// Annualised portfolio volatility `sqrt(w' C w)`.
pub fn volatility(weights: &DVector<f64>, cov: &CovarianceMatrix) -> Result<f64> {
    check_len(weights, cov.matrix.nrows())?;
    let variance = weights.dot(&(&cov.matrix * weights));
    // Rounding can push a PSD quadratic form a hair below zero.
    Ok(variance.max(0.0).sqrt())
}

pub fn sharpe(
    weights: &DVector<f64>,
    returns: &ReturnMatrix,
    cov: &CovarianceMatrix,
    risk_free_rate: f64,
) -> Result<f64> {
    let vol = volatility(weights, cov)?;
    if vol <= 0.0 {
        return Err(NumericError::ZeroVolatility.into());
    }
    Ok((expected_return(weights, returns)? - risk_free_rate) / vol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::series::Price;
    use time::macros::date;

    fn two_asset_returns() -> ReturnMatrix {
        let dates = vec![
            date!(2024 - 01 - 02),
            date!(2024 - 01 - 03),
            date!(2024 - 01 - 04),
            date!(2024 - 01 - 05),
        ];
        ReturnMatrix::from_columns(
            vec!["A".into(), "B".into()],
            dates,
            &[
                vec![0.01, -0.01, 0.02, -0.02],
                vec![0.02, -0.01, 0.01, -0.015],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_log_returns() {
        let base = date!(2024 - 03 - 01);
        let mut prices = PriceSeries::new();
        let values = [100.0, 105.0, 103.0, 108.0];
        let _ = prices.insert(
            "SPY",
            values
                .iter()
                .enumerate()
                .map(|(i, &value)| Price {
                    value,
                    date: base + time::Duration::days(i as i64),
                })
                .collect(),
        );

        let expected_returns = [0.04879, -0.01923, 0.04740];
        let returns = log_returns(&prices);

        assert_eq!(returns.observations(), expected_returns.len());
        let actual = returns.column("SPY").unwrap();
        for (a, e) in actual.iter().zip(expected_returns.iter()) {
            assert!((a - e).abs() < 1e-4);
        }
        assert_eq!(returns.dates()[0], base + time::Duration::days(1));
    }

    #[test]
    fn test_log_returns_drop_misaligned_rows() {
        let d = |n: i64| date!(2024 - 03 - 01) + time::Duration::days(n);
        let mut prices = PriceSeries::new();
        let _ = prices.insert(
            "AAA",
            (0..5)
                .map(|i| Price {
                    value: 10.0 + i as f64,
                    date: d(i),
                })
                .collect(),
        );
        // BBB has no price on day 2, so the returns on days 2 and 3 are undefined.
        let _ = prices.insert(
            "BBB",
            [0, 1, 3, 4]
                .iter()
                .map(|&i| Price {
                    value: 20.0 + i as f64,
                    date: d(i),
                })
                .collect(),
        );

        let returns = log_returns(&prices);
        assert_eq!(returns.dates(), &[d(1), d(4)]);
        assert_eq!(returns.tickers(), &["AAA".to_string(), "BBB".to_string()]);
        assert!(returns.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_covariance_is_annualised_sample_covariance() {
        let returns = two_asset_returns();
        let cov = covariance(&returns).unwrap();
        let m = cov.matrix();

        // var(A) = (1e-4 + 1e-4 + 4e-4 + 4e-4) / 3
        let var_a = 0.001 / 3.0 * TRADING_DAYS;
        assert!((m[(0, 0)] - var_a).abs() < 1e-12);
        assert!((m[(0, 1)] - m[(1, 0)]).abs() < 1e-15);
        assert!(!cov.is_singular());
    }

    #[test]
    fn test_covariance_singular_with_few_observations() {
        let returns = ReturnMatrix::from_columns(
            vec!["A".into(), "B".into(), "C".into()],
            vec![date!(2024 - 01 - 02), date!(2024 - 01 - 03)],
            &[vec![0.01, 0.02], vec![0.0, 0.01], vec![-0.01, 0.03]],
        )
        .unwrap();
        assert!(covariance(&returns).unwrap().is_singular());

        let one_row = ReturnMatrix::from_columns(
            vec!["A".into()],
            vec![date!(2024 - 01 - 02)],
            &[vec![0.01]],
        )
        .unwrap();
        assert!(matches!(
            covariance(&one_row),
            Err(Error::Numeric(NumericError::InsufficientObservations { .. }))
        ));
    }

    #[test]
    fn test_expected_return_volatility_and_sharpe() {
        let returns = two_asset_returns();
        let cov = covariance(&returns).unwrap();
        let w = DVector::from_vec(vec![0.5, 0.5]);

        // mean(A) = 0, mean(B) = 0.00125
        let er = expected_return(&w, &returns).unwrap();
        assert!((er - 0.5 * 0.00125 * TRADING_DAYS).abs() < 1e-12);

        let vol = volatility(&w, &cov).unwrap();
        assert!(vol > 0.0);

        let s = sharpe(&w, &returns, &cov, 0.02).unwrap();
        assert!((s - (er - 0.02) / vol).abs() < 1e-12);
    }

    #[test]
    fn test_sharpe_zero_volatility() {
        let returns = ReturnMatrix::from_columns(
            vec!["FLAT".into()],
            (0..5).map(|i| date!(2024 - 01 - 01) + time::Duration::days(i)).collect(),
            &[vec![0.0; 5]],
        )
        .unwrap();
        let cov = covariance(&returns).unwrap();
        let w = DVector::from_vec(vec![1.0]);
        assert!(matches!(
            sharpe(&w, &returns, &cov, 0.02),
            Err(Error::Numeric(NumericError::ZeroVolatility))
        ));
    }

    #[test]
    fn test_weight_dimension_checked() {
        let returns = two_asset_returns();
        let w = DVector::from_vec(vec![1.0]);
        assert!(matches!(
            expected_return(&w, &returns),
            Err(Error::Config(ConfigError::DimensionMismatch { .. }))
        ));
    }
}
