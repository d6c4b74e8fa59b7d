//! Long-only maximum-Sharpe optimisation under a per-asset weight cap.
//!
//! The feasible set `{w : sum(w) = 1, 0 <= w_i <= cap}` is convex, so the
//! solver runs projected gradient ascent on the Sharpe ratio from the uniform
//! portfolio, with an Armijo backtracking line search. Every iterate is the
//! Euclidean projection of a gradient step onto that set, which keeps the
//! budget and the bounds satisfied by construction. A single run is made; no
//! global search.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::OptimizerSettings;
use crate::error::{ConfigError, NumericError, Result};
use crate::stats::{self, CovarianceMatrix, ReturnMatrix, TRADING_DAYS};

const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-16;
/// First-order Sharpe gain, relative to the Sharpe ratio, below which the
/// iterate is optimal to within rounding.
const GAIN_TOLERANCE: f64 = 1e-14;
/// Looser gain bound accepted when the line search can no longer make progress.
const STALL_GAIN_TOLERANCE: f64 = 1e-10;
const PROJECTION_ROUNDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

/// How the solver exited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
    /// Infinity norm of `P(w + grad) - w` at exit; zero at a KKT point.
    pub stationarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationWarning {
    /// Fewer observations than assets, or the matrix failed to factor.
    SingularCovariance,
    /// The iteration limit or line search stopped the solver early.
    NotConverged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub tickers: Vec<String>,
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub convergence: Convergence,
    pub warnings: Vec<OptimizationWarning>,
}

impl OptimizationResult {
    pub fn metrics(&self) -> PortfolioMetrics {
        PortfolioMetrics {
            expected_return: self.expected_return,
            volatility: self.volatility,
            sharpe_ratio: self.sharpe_ratio,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortfolioOptimizer {
    settings: OptimizerSettings,
}

/// Sharpe ratio and its gradient with the annualised inputs held fixed.
struct SharpeObjective<'a> {
    mean: DVector<f64>,
    cov: &'a DMatrix<f64>,
    risk_free_rate: f64,
}

impl SharpeObjective<'_> {
    fn value(&self, w: &DVector<f64>) -> Option<f64> {
        let vol = w.dot(&(self.cov * w)).max(0.0).sqrt();
        if vol <= 0.0 {
            return None;
        }
        let s = (w.dot(&self.mean) - self.risk_free_rate) / vol;
        s.is_finite().then_some(s)
    }

    fn gradient(&self, w: &DVector<f64>) -> Option<DVector<f64>> {
        let cov_w = self.cov * w;
        let variance = w.dot(&cov_w);
        if variance <= 0.0 {
            return None;
        }
        let vol = variance.sqrt();
        let excess = w.dot(&self.mean) - self.risk_free_rate;
        let grad = &self.mean / vol - cov_w * (excess / (variance * vol));
        grad.iter().all(|g| g.is_finite()).then_some(grad)
    }
}

impl PortfolioOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self { settings }
    }

    /// Find the weights maximising the Sharpe ratio with every weight in
    /// `[0, max_weight]` and the weights summing to one.
    ///
    /// Requires `max_weight >= 1 / tickers.len()`, otherwise no portfolio is
    /// feasible. An unconverged solve is still returned, flagged through
    /// [`OptimizationResult::convergence`].
    #[tracing::instrument(skip(self, returns, cov), fields(n = tickers.len()))]
    pub fn optimize(
        &self,
        tickers: &[String],
        returns: &ReturnMatrix,
        cov: &CovarianceMatrix,
        risk_free_rate: f64,
        max_weight: f64,
    ) -> Result<OptimizationResult> {
        self.validate(tickers, returns, cov, max_weight)?;
        if !risk_free_rate.is_finite() {
            return Err(NumericError::NonFinite("risk-free rate").into());
        }

        let n = tickers.len();
        let objective = SharpeObjective {
            mean: returns.mean_daily() * TRADING_DAYS,
            cov: cov.matrix(),
            risk_free_rate,
        };

        let mut weights = DVector::from_element(n, 1.0 / n as f64);
        let mut sharpe = objective.value(&weights).ok_or(NumericError::ZeroVolatility)?;
        let mut step = 1.0;
        let mut iterations = 0;
        let mut stationarity = f64::INFINITY;
        let mut converged = false;

        while iterations < self.settings.max_iterations {
            let Some(grad) = objective.gradient(&weights) else {
                break;
            };
            let direction = project_capped_simplex(&(&weights + &grad), max_weight) - &weights;
            stationarity = direction.amax();
            let gain = grad.dot(&direction);
            let scale = sharpe.abs().max(1.0);
            if stationarity <= self.settings.tolerance * grad.amax().max(1.0)
                || gain <= GAIN_TOLERANCE * scale
            {
                converged = true;
                break;
            }

            let mut accepted = None;
            while step >= MIN_STEP {
                let candidate = project_capped_simplex(&(&weights + &grad * step), max_weight);
                let ascent = grad.dot(&(&candidate - &weights));
                match objective.value(&candidate) {
                    Some(value) if value >= sharpe + ARMIJO * ascent => {
                        accepted = Some((candidate, value));
                        break;
                    }
                    _ => step *= 0.5,
                }
            }
            iterations += 1;

            let Some((candidate, value)) = accepted else {
                converged = gain <= STALL_GAIN_TOLERANCE * scale;
                tracing::debug!(gain, converged, "line search stalled at iteration {iterations}");
                break;
            };
            weights = candidate;
            sharpe = value;
            step = (step * 2.0).min(1e3);
        }

        let mut warnings = Vec::new();
        if cov.is_singular() {
            warnings.push(OptimizationWarning::SingularCovariance);
        }
        if !converged {
            warnings.push(OptimizationWarning::NotConverged);
        }
        tracing::info!(iterations, converged, stationarity, "solver finished");

        let expected_return = stats::expected_return(&weights, returns)?;
        let volatility = stats::volatility(&weights, cov)?;
        let sharpe_ratio = stats::sharpe(&weights, returns, cov, risk_free_rate)?;

        Ok(OptimizationResult {
            tickers: tickers.to_vec(),
            weights: weights.iter().copied().collect(),
            expected_return,
            volatility,
            sharpe_ratio,
            convergence: Convergence {
                converged,
                iterations,
                stationarity,
            },
            warnings,
        })
    }

    /// Checks that need no data: ticker count and cap feasibility. Callers
    /// run this before fetching anything.
    pub fn validate_request(&self, tickers: &[String], max_weight: f64) -> Result<()> {
        if tickers.is_empty() {
            return Err(ConfigError::EmptyTickers.into());
        }
        if tickers.len() > self.settings.max_tickers {
            return Err(ConfigError::TooManyTickers {
                max: self.settings.max_tickers,
            }
            .into());
        }
        if !(max_weight > 0.0 && max_weight <= 1.0) {
            return Err(ConfigError::MaxWeightOutOfRange(max_weight).into());
        }
        // Allow exactly 1/N despite rounding in the caller's division.
        if max_weight * (tickers.len() as f64) < 1.0 - 1e-12 {
            return Err(ConfigError::InfeasibleMaxWeight {
                max_weight,
                tickers: tickers.len(),
            }
            .into());
        }
        Ok(())
    }

    fn validate(
        &self,
        tickers: &[String],
        returns: &ReturnMatrix,
        cov: &CovarianceMatrix,
        max_weight: f64,
    ) -> Result<()> {
        self.validate_request(tickers, max_weight)?;
        if returns.tickers() != tickers || cov.tickers() != tickers {
            if let Some(missing) = tickers.iter().find(|t| returns.index_of(t).is_none()) {
                return Err(ConfigError::MissingReturns(missing.clone()).into());
            }
            return Err(ConfigError::DimensionMismatch {
                expected: tickers.len(),
                actual: cov.tickers().len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Euclidean projection onto `{w : sum(w) = 1, 0 <= w_i <= cap}`.
///
/// The projection is `clamp(v_i - tau, 0, cap)` for the unique shift `tau`
/// making the sum one; `tau` is found by bisection. Requires `cap * n >= 1`.
pub fn project_capped_simplex(v: &DVector<f64>, cap: f64) -> DVector<f64> {
    let shifted_sum = |tau: f64| v.iter().map(|x| (x - tau).clamp(0.0, cap)).sum::<f64>();

    let mut lo = v.min() - cap;
    let mut hi = v.max();
    for _ in 0..PROJECTION_ROUNDS {
        let mid = 0.5 * (lo + hi);
        if shifted_sum(mid) > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= f64::EPSILON * hi.abs().max(1.0) {
            break;
        }
    }
    let tau = 0.5 * (lo + hi);
    v.map(|x| (x - tau).clamp(0.0, cap))
}
