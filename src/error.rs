//! Error taxonomy for the dashboard core.
//!
//! The four families map onto the three things a user can actually do about a
//! failure: retry later, fix the inputs, or change parameters because the
//! result would be mathematically meaningless.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not get market data: {0}")]
    Data(#[from] DataError),

    #[error("invalid input: {0}")]
    Config(#[from] ConfigError),

    #[error("result is mathematically invalid: {0}")]
    Numeric(#[from] NumericError),

    #[error("storage operation failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Data,
    Configuration,
    Numeric,
    Persistence,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Data(_) => ErrorKind::Data,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Numeric(_) => ErrorKind::Numeric,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Short hint telling the user which way to go next.
    pub fn remediation(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Data => "market data is unavailable right now, try again later",
            ErrorKind::Configuration => "check the tickers and parameters you entered",
            ErrorKind::Numeric => {
                "the data cannot support this calculation, change the tickers or date range"
            }
            ErrorKind::Persistence => "the portfolio store is unreachable, try again later",
        }
    }
}

/// Failures talking to a market-data or rate provider.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("provider error for {ticker}: {message}")]
    Provider { ticker: String, message: String },

    #[error("no usable prices returned for {ticker}")]
    Empty { ticker: String },

    #[error("no price history could be fetched for any requested ticker")]
    AllTickersFailed,

    #[error("quote unavailable for {ticker}: {message}")]
    Quote { ticker: String, message: String },

    #[error("risk-free rate unavailable: {0}")]
    RiskFreeRate(String),
}

/// Caller-supplied parameters that cannot work. Never retried.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("at least one ticker is required")]
    EmptyTickers,

    #[error("at most {max} tickers are allowed")]
    TooManyTickers { max: usize },

    #[error("invalid ticker symbol '{0}'")]
    InvalidTicker(String),

    #[error("ticker {0} was given more than once")]
    DuplicateTicker(String),

    #[error(
        "maximum weight {max_weight} is too low for {tickers} tickers, it must be at least 1/{tickers}"
    )]
    InfeasibleMaxWeight { max_weight: f64, tickers: usize },

    #[error("maximum weight {0} must be greater than 0 and at most 1")]
    MaxWeightOutOfRange(f64),

    #[error("confidence {0} must be strictly between 0 and 100")]
    ConfidenceOutOfRange(f64),

    #[error("window of {window} days must be between 1 and {max}")]
    WindowOutOfRange { window: usize, max: usize },

    #[error("no current price for {0}")]
    MissingPrice(String),

    #[error("no return history for {0}")]
    MissingReturns(String),

    #[error("share count {0} is invalid")]
    InvalidShares(f64),

    #[error("a portfolio name is required")]
    EmptyName,

    #[error("cash amount {0} must not be negative")]
    NegativeCash(f64),

    #[error("portfolio has no market value")]
    ZeroNotional,

    #[error("invalid date range: {0}")]
    DateRange(String),

    #[error("expected {expected} values but got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("settings file: {0}")]
    Settings(String),

    #[error("environment variable {0} is not set")]
    MissingSecret(&'static str),
}

/// Degenerate numerics: the inputs were valid but the maths is undefined.
#[derive(Error, Debug, PartialEq)]
pub enum NumericError {
    #[error("portfolio volatility is zero, the Sharpe ratio is undefined")]
    ZeroVolatility,

    #[error("{observations} aligned observations, at least {required} are required")]
    InsufficientObservations { observations: usize, required: usize },

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("store responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot remove {requested} shares of {ticker}, only {owned} owned")]
    InsufficientShares {
        ticker: String,
        owned: f64,
        requested: f64,
    },

    #[error("could not decode store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PersistenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}
