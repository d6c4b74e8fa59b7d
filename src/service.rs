//! User-level operations, wired from injected collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

use crate::config::Settings;
use crate::error::{ConfigError, DataError, PersistenceError, Result};
use crate::market_data::{PriceSeriesFetcher, RiskFreeRateSource};
use crate::optimize::{OptimizationResult, PortfolioOptimizer};
use crate::series::{normalize_ticker, normalize_tickers, PriceSeries};
use crate::stats;
use crate::store::{
    round_shares, NewTransaction, PortfolioStore, SavedPortfolio, Transaction, TransactionFilter,
    TransactionKind,
};
use crate::valuation::{self, PortfolioPosition, PortfolioValuation};
use crate::var::{HistoricalVaREstimator, VaRResult};

/// Largest number of shares a single trade may move.
pub const MAX_TRADE_SHARES: f64 = 1e7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub tickers: Vec<String>,
    pub start: Date,
    pub end: Date,
    pub max_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub result: OptimizationResult,
    /// Annual rate as a fraction.
    pub risk_free_rate: f64,
    /// Requested tickers left out because no usable history was fetched.
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub var: VaRResult,
    pub dropped: Vec<String>,
}

/// Portfolio and benchmark value, both rebased to 100 on their first day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub benchmark: String,
    pub portfolio: Vec<(Date, f64)>,
    pub benchmark_values: Vec<(Date, f64)>,
    pub dropped: Vec<String>,
}

pub struct Dashboard {
    fetcher: PriceSeriesFetcher,
    risk_free: Option<Arc<dyn RiskFreeRateSource>>,
    store: Arc<dyn PortfolioStore>,
    optimizer: PortfolioOptimizer,
    estimator: HistoricalVaREstimator,
    settings: Settings,
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

fn years_before(date: Date, years: i64) -> Date {
    let year = i32::try_from(i64::from(date.year()) - years).unwrap_or(i32::MIN);
    date.replace_year(year)
        .or_else(|_| Date::from_calendar_date(year, date.month(), 28))
        .unwrap_or(Date::MIN)
}

fn check_shares(shares: f64) -> std::result::Result<f64, ConfigError> {
    if !(shares.is_finite() && shares > 0.0 && shares <= MAX_TRADE_SHARES) {
        return Err(ConfigError::InvalidShares(shares));
    }
    let rounded = round_shares(shares);
    if rounded == 0.0 {
        return Err(ConfigError::InvalidShares(shares));
    }
    Ok(rounded)
}

impl Dashboard {
    /// `risk_free` may be absent when only portfolio bookkeeping is needed;
    /// optimisation then fails with a missing-secret error.
    pub fn new(
        fetcher: PriceSeriesFetcher,
        risk_free: Option<Arc<dyn RiskFreeRateSource>>,
        store: Arc<dyn PortfolioStore>,
        settings: Settings,
    ) -> Self {
        Self {
            fetcher,
            risk_free,
            store,
            optimizer: PortfolioOptimizer::new(settings.optimizer.clone()),
            estimator: HistoricalVaREstimator::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Latest annual risk-free rate as a fraction.
    pub async fn risk_free_rate(&self) -> Result<f64> {
        let source = self
            .risk_free
            .as_ref()
            .ok_or(ConfigError::MissingSecret("FRED_API_KEY"))?;
        let percent = source
            .latest_percent(&self.settings.risk_free.series_id)
            .await?;
        Ok(percent / 100.0)
    }

    fn check_history_window(&self, start: Date, end: Date, today: Date) -> Result<()> {
        let opt = &self.settings.optimizer;
        if end > today {
            return Err(ConfigError::DateRange(format!("end date {end} is in the future")).into());
        }
        if (end - start).whole_days() < opt.min_history_days {
            return Err(ConfigError::DateRange(format!(
                "start date must be at least {} days before the end date",
                opt.min_history_days
            ))
            .into());
        }
        let earliest = years_before(today, i64::from(opt.max_history_years));
        if start < earliest {
            return Err(ConfigError::DateRange(format!(
                "start date must not be earlier than {earliest}"
            ))
            .into());
        }
        Ok(())
    }

    /// Fetch history for the requested tickers and find the maximum-Sharpe
    /// weights among those that could be fetched.
    #[tracing::instrument(skip(self))]
    pub async fn run_optimization(&self, request: &OptimizationRequest) -> Result<OptimizationReport> {
        let tickers = normalize_tickers(&request.tickers)?;
        self.optimizer
            .validate_request(&tickers, request.max_weight)?;
        self.check_history_window(request.start, request.end, today())?;
        let risk_free_rate = self.risk_free_rate().await?;

        let outcome = self
            .fetcher
            .fetch(&tickers, request.start, request.end)
            .await;
        if outcome.series.is_empty() {
            return Err(DataError::AllTickersFailed.into());
        }
        let available = outcome.series.tickers().to_vec();
        let returns = stats::log_returns(&outcome.series);
        let cov = stats::covariance(&returns)?;
        let result = self.optimizer.optimize(
            &available,
            &returns,
            &cov,
            risk_free_rate,
            request.max_weight,
        )?;

        tracing::info!(
            tickers = available.len(),
            dropped = outcome.dropped.len(),
            sharpe = result.sharpe_ratio,
            "optimisation complete"
        );
        Ok(OptimizationReport {
            result,
            risk_free_rate,
            dropped: outcome.dropped,
        })
    }

    pub async fn save_portfolio(
        &self,
        owner: &str,
        name: &str,
        result: &OptimizationResult,
    ) -> Result<SavedPortfolio> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName.into());
        }
        let portfolio = SavedPortfolio {
            owner: owner.to_string(),
            name: name.to_string(),
            tickers: result.tickers.clone(),
            weights: result.weights.clone(),
            metrics: result.metrics(),
            created_at: Utc::now(),
        };
        self.store.save_portfolio(&portfolio).await?;
        Ok(portfolio)
    }

    pub async fn saved_portfolios(&self, owner: &str) -> Result<Vec<SavedPortfolio>> {
        Ok(self.store.list_portfolios(owner).await?)
    }

    /// Deletes every saved portfolio of `owner` with this name.
    pub async fn delete_portfolio(&self, owner: &str, name: &str) -> Result<usize> {
        let removed = self.store.delete_portfolio(owner, name.trim()).await?;
        if removed == 0 {
            return Err(PersistenceError::NotFound(format!("saved portfolio '{name}'")).into());
        }
        Ok(removed)
    }

    /// Latest price from the intraday feed, falling back to the last daily
    /// close of the past few days.
    pub async fn latest_price(&self, ticker: &str) -> Result<f64> {
        match self.fetcher.source().get_recent_closes(ticker).await {
            Ok(closes) => {
                if let Some(price) = valuation::latest_price(&closes) {
                    return Ok(price);
                }
                tracing::debug!("no usable intraday close for {ticker}");
            }
            Err(e) => tracing::debug!("intraday closes for {ticker} failed: {e}"),
        }

        let end = today();
        let start = end - Duration::days(self.settings.risk.latest_price_lookback_days);
        let prices = self.fetcher.fetch_one(ticker, start, end).await?;
        prices
            .iter()
            .rev()
            .map(|p| p.value)
            .find(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| {
                DataError::Empty {
                    ticker: ticker.to_string(),
                }
                .into()
            })
    }

    /// Historical VaR of the owner's current positions.
    ///
    /// Positions whose price or history cannot be fetched are left out and
    /// reported in [`RiskReport::dropped`].
    #[tracing::instrument(skip(self))]
    pub async fn compute_var(
        &self,
        owner: &str,
        window_days: usize,
        confidence: f64,
    ) -> Result<RiskReport> {
        if !(confidence > 0.0 && confidence < 100.0) {
            return Err(ConfigError::ConfidenceOutOfRange(confidence).into());
        }
        // The exact upper bound needs the fetched history; zero never works.
        if window_days == 0 {
            return Err(ConfigError::WindowOutOfRange {
                window: 0,
                max: self.settings.risk.lookback_years as usize * 366,
            }
            .into());
        }
        let positions = self.store.positions(owner).await?;
        if positions.is_empty() {
            return Err(ConfigError::ZeroNotional.into());
        }
        let tickers: Vec<String> = positions.iter().map(|p| p.ticker.clone()).collect();
        let shares: HashMap<String, f64> = positions
            .iter()
            .map(|p| (p.ticker.clone(), p.share_count))
            .collect();

        let mut dropped = Vec::new();
        let mut latest_prices = HashMap::new();
        for ticker in &tickers {
            match self.latest_price(ticker).await {
                Ok(price) => {
                    let _ = latest_prices.insert(ticker.clone(), price);
                }
                Err(e) => {
                    tracing::warn!("dropping {ticker} from VaR: {e}");
                    dropped.push(ticker.clone());
                }
            }
        }

        let end = today();
        let start = years_before(end, self.settings.risk.lookback_years);
        let outcome = self.fetcher.fetch(&tickers, start, end).await;
        for ticker in outcome.dropped {
            if !dropped.contains(&ticker) {
                dropped.push(ticker);
            }
        }

        let usable: Vec<String> = tickers
            .into_iter()
            .filter(|t| latest_prices.contains_key(t) && outcome.series.contains(t))
            .collect();
        if usable.is_empty() {
            return Err(DataError::AllTickersFailed.into());
        }
        let returns = stats::log_returns(&outcome.series.subset(&usable));
        let var = self.estimator.estimate(
            &usable,
            &shares,
            &returns,
            &latest_prices,
            window_days,
            confidence,
        )?;
        Ok(RiskReport { var, dropped })
    }

    async fn trade(
        &self,
        owner: &str,
        ticker: &str,
        shares: f64,
        notes: Option<&str>,
        kind: TransactionKind,
    ) -> Result<Transaction> {
        let ticker = normalize_ticker(ticker)?;
        let shares = check_shares(shares)?;
        let quote = self.fetcher.quote(&ticker).await?;

        let delta = match kind {
            TransactionKind::Buy => shares,
            TransactionKind::Sell => -shares,
        };
        let remaining = self.store.adjust_shares(owner, &ticker, delta).await?;
        tracing::info!("{kind:?} {shares} {ticker} at {}, now holding {remaining}", quote.price);

        let notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("N/A");
        let recorded = self
            .store
            .record_transaction(NewTransaction {
                owner: owner.to_string(),
                date: Utc::now(),
                kind,
                ticker: ticker.clone(),
                shares,
                price_per_share: quote.price,
                total_value: shares * quote.price,
                notes: notes.to_string(),
            })
            .await;
        match recorded {
            Ok(txn) => Ok(txn),
            Err(e) => {
                // Undo the share change so positions never move without a log entry.
                if let Err(undo) = self.store.adjust_shares(owner, &ticker, -delta).await {
                    tracing::error!("could not revert {ticker} after failed log write: {undo}");
                }
                Err(e.into())
            }
        }
    }

    pub async fn buy(
        &self,
        owner: &str,
        ticker: &str,
        shares: f64,
        notes: Option<&str>,
    ) -> Result<Transaction> {
        self.trade(owner, ticker, shares, notes, TransactionKind::Buy)
            .await
    }

    /// Fails without recording anything when fewer shares are held.
    pub async fn sell(
        &self,
        owner: &str,
        ticker: &str,
        shares: f64,
        notes: Option<&str>,
    ) -> Result<Transaction> {
        self.trade(owner, ticker, shares, notes, TransactionKind::Sell)
            .await
    }

    pub async fn cash(&self, owner: &str) -> Result<f64> {
        Ok(self.store.cash(owner).await?)
    }

    pub async fn set_cash(&self, owner: &str, amount: f64) -> Result<()> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(ConfigError::NegativeCash(amount).into());
        }
        Ok(self.store.set_cash(owner, amount).await?)
    }

    /// Matching transactions, newest first.
    pub async fn transactions(
        &self,
        owner: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        let mut txns: Vec<Transaction> = self
            .store
            .transactions(owner)
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        txns.sort_by(|a, b| b.details.date.cmp(&a.details.date));
        Ok(txns)
    }

    pub async fn delete_transaction(&self, owner: &str, id: &str) -> Result<()> {
        Ok(self.store.delete_transaction(owner, id).await?)
    }

    /// Current value and day change of every position, plus cash.
    #[tracing::instrument(skip(self))]
    pub async fn holdings(&self, owner: &str) -> Result<PortfolioValuation> {
        let positions = self.store.positions(owner).await?;
        let mut valued = Vec::with_capacity(positions.len());
        for position in positions {
            let quote = self.fetcher.quote(&position.ticker).await?;
            valued.push(PortfolioPosition {
                ticker: position.ticker,
                share_count: position.share_count,
                current_price: quote.price,
                previous_close: quote.previous_close,
            });
        }
        let cash = self.store.cash(owner).await?;
        Ok(PortfolioValuation::new(valued, cash))
    }

    /// Value of today's holdings over `[start, end]` against the benchmark.
    ///
    /// Share counts are held fixed at their current values.
    #[tracing::instrument(skip(self))]
    pub async fn benchmark(&self, owner: &str, start: Date, end: Date) -> Result<BenchmarkComparison> {
        if start >= end {
            return Err(ConfigError::DateRange("start date must be before the end date".into()).into());
        }
        let positions = self.store.positions(owner).await?;
        if positions.is_empty() {
            return Err(ConfigError::ZeroNotional.into());
        }
        let tickers: Vec<String> = positions.iter().map(|p| p.ticker.clone()).collect();
        let shares: HashMap<String, f64> = positions
            .into_iter()
            .map(|p| (p.ticker, p.share_count))
            .collect();

        let outcome = self.fetcher.fetch(&tickers, start, end).await;
        if outcome.series.is_empty() {
            return Err(DataError::AllTickersFailed.into());
        }
        let portfolio = valuation::normalize(&valuation::value_series(&outcome.series, &shares))?;

        let benchmark = self.settings.benchmark.ticker.clone();
        let mut benchmark_series = PriceSeries::new();
        let prices = self.fetcher.fetch_one(&benchmark, start, end).await?;
        if !benchmark_series.insert(&benchmark, prices) {
            return Err(DataError::Empty { ticker: benchmark }.into());
        }
        let benchmark_values: Vec<(Date, f64)> = benchmark_series
            .get(&benchmark)
            .unwrap_or_default()
            .iter()
            .map(|p| (p.date, p.value))
            .collect();
        let benchmark_values = valuation::normalize(&benchmark_values)?;

        Ok(BenchmarkComparison {
            benchmark,
            portfolio,
            benchmark_values,
            dropped: outcome.dropped,
        })
    }
}
