//! Persistence of positions, cash, transactions and saved optimisations.

mod memory;
mod supabase;

pub use memory::InMemoryStore;
pub use supabase::SupabaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::optimize::PortfolioMetrics;

/// Share counts are kept to four decimal places so that selling everything
/// lands exactly on zero.
pub const SHARE_DECIMALS: i32 = 4;

pub fn round_shares(shares: f64) -> f64 {
    let scale = 10f64.powi(SHARE_DECIMALS);
    (shares * scale).round() / scale
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPortfolio {
    pub owner: String,
    pub name: String,
    pub tickers: Vec<String>,
    pub weights: Vec<f64>,
    pub metrics: PortfolioMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub share_count: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub owner: String,
    pub date: DateTime<Utc>,
    pub kind: TransactionKind,
    pub ticker: String,
    pub shares: f64,
    pub price_per_share: f64,
    pub total_value: f64,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    #[serde(flatten)]
    pub details: NewTransaction,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Empty means every kind.
    pub kinds: Vec<TransactionKind>,
    /// Empty means every ticker.
    pub tickers: Vec<String>,
}

impl TransactionFilter {
    pub fn matches(&self, txn: &Transaction) -> bool {
        let d = &txn.details;
        self.from.map_or(true, |from| d.date >= from)
            && self.to.map_or(true, |to| d.date <= to)
            && (self.kinds.is_empty() || self.kinds.contains(&d.kind))
            && (self.tickers.is_empty() || self.tickers.contains(&d.ticker))
    }
}

/// Typed rows keyed by owner. Every method is a single atomic call; nothing
/// spans two calls.
#[async_trait]
pub trait PortfolioStore: Send + Sync {
    async fn save_portfolio(&self, portfolio: &SavedPortfolio) -> Result<(), PersistenceError>;

    async fn list_portfolios(&self, owner: &str) -> Result<Vec<SavedPortfolio>, PersistenceError>;

    /// Delete every saved portfolio of `owner` named `name`; returns how many
    /// went. Names are not unique, so duplicates are removed together.
    async fn delete_portfolio(&self, owner: &str, name: &str) -> Result<usize, PersistenceError>;

    async fn positions(&self, owner: &str) -> Result<Vec<Position>, PersistenceError>;

    /// Atomically add `delta` (negative to sell) to a position and return the
    /// new count. Fails without changing anything when the result would be
    /// negative; a position reaching exactly zero is removed.
    async fn adjust_shares(
        &self,
        owner: &str,
        ticker: &str,
        delta: f64,
    ) -> Result<f64, PersistenceError>;

    async fn cash(&self, owner: &str) -> Result<f64, PersistenceError>;

    async fn set_cash(&self, owner: &str, amount: f64) -> Result<(), PersistenceError>;

    async fn record_transaction(
        &self,
        txn: NewTransaction,
    ) -> Result<Transaction, PersistenceError>;

    async fn transactions(&self, owner: &str) -> Result<Vec<Transaction>, PersistenceError>;

    async fn delete_transaction(&self, owner: &str, id: &str) -> Result<(), PersistenceError>;
}
