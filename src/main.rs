use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use portfolio_dashboard::config::{Secrets, Settings, DEFAULT_SETTINGS_PATH};
use portfolio_dashboard::market_data::{
    FixedRate, FredClient, MarketDataSource, PriceSeriesFetcher, RetryPolicy, RiskFreeRateSource,
    TokioSleeper, YahooSource,
};
use portfolio_dashboard::service::OptimizationRequest;
use portfolio_dashboard::store::{InMemoryStore, PortfolioStore, SupabaseStore, TransactionFilter, TransactionKind};
use portfolio_dashboard::{Dashboard, Result};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "portfolio-dashboard")]
#[command(about = "Portfolio optimisation, risk and holdings from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file path
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    config: String,

    /// Owner of the positions and saved portfolios
    #[arg(short, long, default_value = "local")]
    user: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the maximum-Sharpe weights for a set of tickers
    Optimize {
        /// Comma-separated tickers
        #[arg(value_delimiter = ',', required = true)]
        tickers: Vec<String>,
        /// First day of history (YYYY-MM-DD); one year before the end by default
        #[arg(long, value_parser = parse_date)]
        start: Option<Date>,
        /// Last day of history (YYYY-MM-DD); today by default
        #[arg(long, value_parser = parse_date)]
        end: Option<Date>,
        /// Largest weight any one ticker may get
        #[arg(long, default_value = "0.5")]
        max_weight: f64,
        /// Save the result under this name
        #[arg(long)]
        save: Option<String>,
    },
    /// Historical Value at Risk of the current positions
    Var {
        /// Holding period in trading days
        #[arg(long)]
        window: Option<usize>,
        /// Confidence level in percent
        #[arg(long)]
        confidence: Option<f64>,
    },
    /// Current value and day change of every position
    Holdings,
    Buy {
        ticker: String,
        shares: f64,
        #[arg(long)]
        notes: Option<String>,
    },
    Sell {
        ticker: String,
        shares: f64,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show the cash balance, or set it when an amount is given
    Cash { amount: Option<f64> },
    /// List transactions, newest first
    Transactions {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long, value_enum)]
        kind: Vec<KindArg>,
        #[arg(long)]
        ticker: Vec<String>,
        /// Delete the transaction with this id instead of listing
        #[arg(long)]
        delete: Option<String>,
    },
    /// Saved optimisation results
    Saved {
        #[command(subcommand)]
        command: SavedCommand,
    },
    /// Compare the current holdings against the benchmark index
    Benchmark {
        #[arg(long, value_parser = parse_date)]
        start: Option<Date>,
        #[arg(long, value_parser = parse_date)]
        end: Option<Date>,
    },
}

#[derive(Subcommand)]
enum SavedCommand {
    List,
    /// Delete every saved portfolio with this name
    Delete { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Buy,
    Sell,
}

impl From<KindArg> for TransactionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Buy => TransactionKind::Buy,
            KindArg::Sell => TransactionKind::Sell,
        }
    }
}

fn parse_date(s: &str) -> std::result::Result<Date, String> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

fn build_dashboard(settings: Settings) -> Result<Dashboard> {
    let secrets = Secrets::from_env();

    let source: Arc<dyn MarketDataSource> = Arc::new(YahooSource::new()?);
    let fetcher = PriceSeriesFetcher::new(
        source,
        RetryPolicy::from(&settings.retry),
        Arc::new(TokioSleeper),
    );

    let risk_free: Option<Arc<dyn RiskFreeRateSource>> =
        match (&secrets.fred_api_key, settings.risk_free.fallback_rate) {
            (Some(key), _) => Some(Arc::new(FredClient::new(key.clone()))),
            (None, Some(rate)) => {
                tracing::info!("FRED_API_KEY not set, using a fixed risk-free rate of {rate}");
                Some(Arc::new(FixedRate {
                    percent: rate * 100.0,
                }))
            }
            (None, None) => None,
        };

    let store: Arc<dyn PortfolioStore> = match secrets.supabase()? {
        Some((url, key)) => Arc::new(SupabaseStore::new(url, key)),
        None => {
            tracing::warn!("SUPABASE_URL not set, positions are kept in memory for this run only");
            Arc::new(InMemoryStore::new())
        }
    };

    Ok(Dashboard::new(fetcher, risk_free, store, settings))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&cli.config)?;
    let dashboard = build_dashboard(settings)?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Optimize {
            tickers,
            start,
            end,
            max_weight,
            save,
        } => {
            let end = end.unwrap_or_else(today);
            let start = start.unwrap_or(end - Duration::days(365));
            let report = dashboard
                .run_optimization(&OptimizationRequest {
                    tickers,
                    start,
                    end,
                    max_weight,
                })
                .await?;
            let result = &report.result;

            println!("{:<10} {:>8}", "TICKER", "WEIGHT");
            for (ticker, weight) in result.tickers.iter().zip(&result.weights) {
                println!("{:<10} {:>7.2}%", ticker, weight * 100.0);
            }
            println!();
            println!("expected return  {:>8.2}%", result.expected_return * 100.0);
            println!("volatility       {:>8.2}%", result.volatility * 100.0);
            println!("sharpe ratio     {:>8.3}", result.sharpe_ratio);
            println!("risk-free rate   {:>8.2}%", report.risk_free_rate * 100.0);
            if !result.convergence.converged {
                println!(
                    "warning: solver stopped after {} iterations without converging",
                    result.convergence.iterations
                );
            }
            for warning in &result.warnings {
                println!("warning: {warning:?}");
            }
            if !report.dropped.is_empty() {
                println!("no data for: {}", report.dropped.join(", "));
            }
            if let Some(name) = save {
                let saved = dashboard.save_portfolio(user, &name, result).await?;
                println!("saved as '{}'", saved.name);
            }
        }
        Commands::Var { window, confidence } => {
            let risk = &dashboard.settings().risk;
            let window = window.unwrap_or(risk.default_window_days);
            let confidence = confidence.unwrap_or(risk.default_confidence);
            let report = dashboard.compute_var(user, window, confidence).await?;
            println!(
                "{}-day VaR at {}%: ${:.2} on a portfolio worth ${:.2}",
                report.var.window_days,
                report.var.confidence_level,
                report.var.value_at_risk,
                report.var.portfolio_value
            );
            if !report.dropped.is_empty() {
                println!("left out (no data): {}", report.dropped.join(", "));
            }
        }
        Commands::Holdings => {
            let valuation = dashboard.holdings(user).await?;
            println!(
                "{:<10} {:>12} {:>12} {:>14} {:>12}",
                "TICKER", "SHARES", "PRICE", "VALUE", "DAY CHANGE"
            );
            for p in &valuation.positions {
                println!(
                    "{:<10} {:>12.4} {:>12.2} {:>14.2} {:>12.2}",
                    p.ticker,
                    p.share_count,
                    p.current_price,
                    p.market_value(),
                    p.total_day_change()
                );
            }
            let s = valuation.summary;
            println!();
            println!("cash         {:>14.2}", s.cash);
            println!("stocks       {:>14.2}", s.stock_value);
            println!("total        {:>14.2}", s.total_value);
            println!("day change   {:>14.2} ({:+.2}%)", s.day_change, s.day_change_pct);
        }
        Commands::Buy {
            ticker,
            shares,
            notes,
        } => {
            let txn = dashboard.buy(user, &ticker, shares, notes.as_deref()).await?;
            let d = &txn.details;
            println!(
                "bought {} {} at {:.2} (total {:.2})",
                d.shares, d.ticker, d.price_per_share, d.total_value
            );
        }
        Commands::Sell {
            ticker,
            shares,
            notes,
        } => {
            let txn = dashboard.sell(user, &ticker, shares, notes.as_deref()).await?;
            let d = &txn.details;
            println!(
                "sold {} {} at {:.2} (total {:.2})",
                d.shares, d.ticker, d.price_per_share, d.total_value
            );
        }
        Commands::Cash { amount } => {
            if let Some(amount) = amount {
                dashboard.set_cash(user, amount).await?;
            }
            println!("cash: {:.2}", dashboard.cash(user).await?);
        }
        Commands::Transactions {
            from,
            to,
            kind,
            ticker,
            delete,
        } => {
            if let Some(id) = delete {
                dashboard.delete_transaction(user, &id).await?;
                println!("deleted transaction {id}");
                return Ok(());
            }
            let filter = TransactionFilter {
                from: from
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt)),
                to: to
                    .and_then(|d| d.and_hms_opt(23, 59, 59))
                    .map(|dt| Utc.from_utc_datetime(&dt)),
                kinds: kind.into_iter().map(TransactionKind::from).collect(),
                tickers: ticker.iter().map(|t| t.trim().to_uppercase()).collect(),
            };
            let txns = dashboard.transactions(user, &filter).await?;
            println!(
                "{:<36} {:<10} {:<5} {:<8} {:>10} {:>10} {:>12}  NOTES",
                "ID", "DATE", "KIND", "TICKER", "SHARES", "PRICE", "TOTAL"
            );
            for t in txns {
                let d = &t.details;
                println!(
                    "{:<36} {:<10} {:<5} {:<8} {:>10.4} {:>10.2} {:>12.2}  {}",
                    t.id,
                    d.date.format("%Y-%m-%d"),
                    format!("{:?}", d.kind),
                    d.ticker,
                    d.shares,
                    d.price_per_share,
                    d.total_value,
                    d.notes
                );
            }
        }
        Commands::Saved { command } => match command {
            SavedCommand::List => {
                for p in dashboard.saved_portfolios(user).await? {
                    let weights: Vec<String> = p
                        .tickers
                        .iter()
                        .zip(&p.weights)
                        .map(|(t, w)| format!("{t} {:.1}%", w * 100.0))
                        .collect();
                    println!(
                        "{} ({}) sharpe {:.3}: {}",
                        p.name,
                        p.created_at.format("%Y-%m-%d"),
                        p.metrics.sharpe_ratio,
                        weights.join(", ")
                    );
                }
            }
            SavedCommand::Delete { name } => {
                let removed = dashboard.delete_portfolio(user, &name).await?;
                println!("deleted {removed} saved portfolio(s) named '{name}'");
            }
        },
        Commands::Benchmark { start, end } => {
            let end = end.unwrap_or_else(today);
            let start = start.unwrap_or(end - Duration::days(365));
            let cmp = dashboard.benchmark(user, start, end).await?;
            let portfolio_last = cmp.portfolio.last().map_or(100.0, |(_, v)| *v);
            let benchmark_last = cmp.benchmark_values.last().map_or(100.0, |(_, v)| *v);
            println!("portfolio     {:>8.2}", portfolio_last);
            println!("{:<13} {:>8.2}", cmp.benchmark, benchmark_last);
            if !cmp.dropped.is_empty() {
                println!("left out (no data): {}", cmp.dropped.join(", "));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!("{e:?}");
            eprintln!("error: {e}");
            eprintln!("{}", e.remediation());
            ExitCode::FAILURE
        }
    }
}
