//! Property-based tests of the optimisation and risk maths.

use std::collections::HashMap;

use nalgebra::DVector;
use portfolio_dashboard::config::OptimizerSettings;
use portfolio_dashboard::error::{ConfigError, Error};
use portfolio_dashboard::optimize::PortfolioOptimizer;
use portfolio_dashboard::stats::{self, CovarianceMatrix, ReturnMatrix};
use portfolio_dashboard::var::HistoricalVaREstimator;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use time::macros::date;
use time::{Date, Duration};

fn tickers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("T{i}")).collect()
}

fn dates(m: usize) -> Vec<Date> {
    (0..m)
        .map(|i| date!(2015 - 01 - 02) + Duration::days(i as i64))
        .collect()
}

fn matrix(columns: &[Vec<f64>]) -> ReturnMatrix {
    ReturnMatrix::from_columns(tickers(columns.len()), dates(columns[0].len()), columns).unwrap()
}

/// `n` assets with more observations than assets, daily returns within 5%.
fn arb_returns() -> impl Strategy<Value = Vec<Vec<f64>>> {
    (2usize..=5, 10usize..=60).prop_flat_map(|(n, m)| {
        proptest::collection::vec(proptest::collection::vec(-0.05f64..0.05, m), n)
    })
}

fn arb_returns_and_weights() -> impl Strategy<Value = (Vec<Vec<f64>>, Vec<f64>)> {
    arb_returns().prop_flat_map(|cols| {
        let n = cols.len();
        (Just(cols), proptest::collection::vec(0.0f64..1.0, n))
    })
}

fn simplex(raw: &[f64]) -> DVector<f64> {
    let total: f64 = raw.iter().sum::<f64>() + 1e-9 * raw.len() as f64;
    DVector::from_iterator(raw.len(), raw.iter().map(|w| (w + 1e-9) / total))
}

fn covariance(returns: &ReturnMatrix) -> CovarianceMatrix {
    stats::covariance(returns).unwrap()
}

fn holdings(returns: &ReturnMatrix, shares: &[f64]) -> (HashMap<String, f64>, HashMap<String, f64>) {
    let shares = returns
        .tickers()
        .iter()
        .cloned()
        .zip(shares.iter().copied())
        .collect();
    let prices = returns
        .tickers()
        .iter()
        .map(|t| (t.clone(), 100.0))
        .collect();
    (shares, prices)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_volatility_is_non_negative((cols, raw) in arb_returns_and_weights()) {
        let returns = matrix(&cols);
        let cov = covariance(&returns);
        let vol = stats::volatility(&simplex(&raw), &cov).unwrap();
        prop_assert!(vol >= 0.0);
        prop_assert!(vol.is_finite());
    }

    #[test]
    fn prop_sharpe_decreases_with_risk_free_rate(
        (cols, raw) in arb_returns_and_weights(),
        rf in -0.05f64..0.1,
        bump in 0.001f64..0.1,
    ) {
        let returns = matrix(&cols);
        let cov = covariance(&returns);
        let w = simplex(&raw);
        prop_assume!(stats::volatility(&w, &cov).unwrap() > 1e-12);

        let low = stats::sharpe(&w, &returns, &cov, rf).unwrap();
        let high = stats::sharpe(&w, &returns, &cov, rf + bump).unwrap();
        prop_assert!(high < low);
    }

    #[test]
    fn prop_infeasible_cap_is_rejected(cols in arb_returns(), frac in 0.01f64..0.99) {
        let returns = matrix(&cols);
        let cov = covariance(&returns);
        let n = cols.len();
        let cap = frac / n as f64;

        let err = PortfolioOptimizer::default()
            .optimize(returns.tickers(), &returns, &cov, 0.02, cap)
            .unwrap_err();
        prop_assert!(
            matches!(err, Error::Config(ConfigError::InfeasibleMaxWeight { .. })),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn prop_optimal_weights_are_feasible(
        cols in arb_returns(),
        frac in 0.0f64..=1.0,
        rf in 0.0f64..0.06,
    ) {
        let returns = matrix(&cols);
        let cov = covariance(&returns);
        let n = cols.len() as f64;
        let cap = 1.0 / n + frac * (1.0 - 1.0 / n);

        let optimizer = PortfolioOptimizer::new(OptimizerSettings::default());
        let result = optimizer
            .optimize(returns.tickers(), &returns, &cov, rf, cap)
            .unwrap();

        let total: f64 = result.weights.iter().sum();
        prop_assert!((total - 1.0).abs() < 1e-4, "weights sum to {total}");
        for w in &result.weights {
            prop_assert!(*w >= -1e-6 && *w <= cap + 1e-6, "weight {w} outside [0, {cap}]");
        }
    }

    #[test]
    fn prop_var_grows_with_confidence(
        (cols, shares) in arb_returns_and_weights(),
        window in 1usize..=5,
    ) {
        let returns = matrix(&cols);
        let (shares, prices) = holdings(&returns, &shares.iter().map(|s| s * 10.0 + 1.0).collect::<Vec<_>>());
        let estimator = HistoricalVaREstimator::new();

        let at = |confidence: f64| {
            estimator
                .estimate(returns.tickers(), &shares, &returns, &prices, window, confidence)
                .unwrap()
                .value_at_risk
        };
        prop_assert!(at(99.0) >= at(95.0));
        prop_assert!(at(95.0) >= at(90.0));
    }
}

#[test]
fn var_does_not_shrink_with_longer_windows() {
    let normal = Normal::new(0.0, 0.01).unwrap();
    for seed in 0..5u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let column: Vec<f64> = (0..3000).map(|_| normal.sample(&mut rng)).collect();
        let returns = matrix(&[column]);
        let (shares, prices) = holdings(&returns, &[50.0]);
        let estimator = HistoricalVaREstimator::new();

        let mut previous = 0.0;
        for window in [1, 5, 20] {
            let var = estimator
                .estimate(returns.tickers(), &shares, &returns, &prices, window, 95.0)
                .unwrap()
                .value_at_risk;
            assert!(
                var >= previous,
                "seed {seed}: {window}-day VaR {var} below shorter window {previous}"
            );
            previous = var;
        }
    }
}
