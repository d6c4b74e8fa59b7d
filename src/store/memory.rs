use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    round_shares, NewTransaction, PortfolioStore, Position, SavedPortfolio, Transaction,
};
use crate::error::PersistenceError;

#[derive(Default)]
struct Tables {
    portfolios: Vec<SavedPortfolio>,
    positions: BTreeMap<(String, String), f64>,
    cash: HashMap<String, f64>,
    transactions: Vec<Transaction>,
}

/// Process-local store. The single lock makes every call atomic, including
/// the read-modify-write in [`PortfolioStore::adjust_shares`].
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortfolioStore for InMemoryStore {
    async fn save_portfolio(&self, portfolio: &SavedPortfolio) -> Result<(), PersistenceError> {
        self.tables.lock().await.portfolios.push(portfolio.clone());
        Ok(())
    }

    async fn list_portfolios(&self, owner: &str) -> Result<Vec<SavedPortfolio>, PersistenceError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .portfolios
            .iter()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect())
    }

    async fn delete_portfolio(&self, owner: &str, name: &str) -> Result<usize, PersistenceError> {
        let mut tables = self.tables.lock().await;
        let before = tables.portfolios.len();
        tables
            .portfolios
            .retain(|p| !(p.owner == owner && p.name == name));
        Ok(before - tables.portfolios.len())
    }

    async fn positions(&self, owner: &str) -> Result<Vec<Position>, PersistenceError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .positions
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((_, ticker), shares)| Position {
                ticker: ticker.clone(),
                share_count: *shares,
            })
            .collect())
    }

    async fn adjust_shares(
        &self,
        owner: &str,
        ticker: &str,
        delta: f64,
    ) -> Result<f64, PersistenceError> {
        let mut tables = self.tables.lock().await;
        let key = (owner.to_string(), ticker.to_string());
        let owned = tables.positions.get(&key).copied().unwrap_or(0.0);
        let updated = round_shares(owned + delta);

        if updated < 0.0 {
            return Err(PersistenceError::InsufficientShares {
                ticker: ticker.to_string(),
                owned,
                requested: -delta,
            });
        }
        if updated == 0.0 {
            let _ = tables.positions.remove(&key);
        } else {
            let _ = tables.positions.insert(key, updated);
        }
        Ok(updated)
    }

    async fn cash(&self, owner: &str) -> Result<f64, PersistenceError> {
        Ok(self
            .tables
            .lock()
            .await
            .cash
            .get(owner)
            .copied()
            .unwrap_or(0.0))
    }

    async fn set_cash(&self, owner: &str, amount: f64) -> Result<(), PersistenceError> {
        let _ = self
            .tables
            .lock()
            .await
            .cash
            .insert(owner.to_string(), amount);
        Ok(())
    }

    async fn record_transaction(
        &self,
        txn: NewTransaction,
    ) -> Result<Transaction, PersistenceError> {
        let stored = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            details: txn,
        };
        self.tables.lock().await.transactions.push(stored.clone());
        Ok(stored)
    }

    async fn transactions(&self, owner: &str) -> Result<Vec<Transaction>, PersistenceError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions
            .iter()
            .filter(|t| t.details.owner == owner)
            .cloned()
            .collect())
    }

    async fn delete_transaction(&self, owner: &str, id: &str) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock().await;
        let before = tables.transactions.len();
        tables
            .transactions
            .retain(|t| !(t.id == id && t.details.owner == owner));
        if tables.transactions.len() == before {
            return Err(PersistenceError::NotFound(format!("transaction {id}")));
        }
        Ok(())
    }
}
