//! Portfolio analytics for a personal investment dashboard: price history
//! with retries, return statistics, maximum-Sharpe optimisation, historical
//! VaR and holdings valuation.

pub mod config;
pub mod error;
pub mod market_data;
pub mod optimize;
pub mod series;
pub mod service;
pub mod stats;
pub mod store;
pub mod valuation;
pub mod var;


pub use error::{Error, ErrorKind, Result};
pub use service::Dashboard;
