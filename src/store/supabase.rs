use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::{
    round_shares, NewTransaction, PortfolioStore, Position, SavedPortfolio, Transaction,
    TransactionKind,
};
use crate::error::PersistenceError;
use crate::optimize::PortfolioMetrics;

const SAVED_TABLE: &str = "saved_optimized_ports";
const POSITIONS_TABLE: &str = "user_portfolio";
const CASH_TABLE: &str = "user_cash";
const TRANSACTIONS_TABLE: &str = "user_transactions";
/// Server-side function doing the share update in one statement; see
/// `resources/supabase/adjust_share_count.sql`.
const ADJUST_SHARES_RPC: &str = "adjust_share_count";

/// Store backed by a Supabase project through its PostgREST API.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Numeric columns have been written both as numbers and as strings.
fn number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {other}"
        ))),
    }
}

fn id_to_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedRow {
    user_id: String,
    port_name: String,
    tickers: Vec<String>,
    weights: Vec<f64>,
    metrics: PortfolioMetrics,
    created_at: DateTime<Utc>,
}

impl From<&SavedPortfolio> for SavedRow {
    fn from(p: &SavedPortfolio) -> Self {
        Self {
            user_id: p.owner.clone(),
            port_name: p.name.clone(),
            tickers: p.tickers.clone(),
            weights: p.weights.clone(),
            metrics: p.metrics,
            created_at: p.created_at,
        }
    }
}

impl From<SavedRow> for SavedPortfolio {
    fn from(r: SavedRow) -> Self {
        Self {
            owner: r.user_id,
            name: r.port_name,
            tickers: r.tickers,
            weights: r.weights,
            metrics: r.metrics,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    ticker_symbol: String,
    #[serde(deserialize_with = "number_or_string")]
    share_count: f64,
}

#[derive(Debug, Deserialize)]
struct CashRow {
    #[serde(deserialize_with = "number_or_string")]
    cash_amount: f64,
}

#[derive(Debug, Deserialize)]
struct AdjustedShares {
    #[serde(deserialize_with = "number_or_string")]
    share_count: f64,
    applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransactionRow {
    #[serde(deserialize_with = "id_to_string", skip_serializing)]
    id: String,
    user_id: String,
    txn_date: DateTime<Utc>,
    txn_type: TransactionKind,
    ticker_symbol: String,
    #[serde(deserialize_with = "number_or_string")]
    shares: f64,
    #[serde(deserialize_with = "number_or_string")]
    price_per_share: f64,
    #[serde(deserialize_with = "number_or_string")]
    total_value: f64,
    notes: String,
}

impl From<TransactionRow> for Transaction {
    fn from(r: TransactionRow) -> Self {
        Self {
            id: r.id,
            details: NewTransaction {
                owner: r.user_id,
                date: r.txn_date,
                kind: r.txn_type,
                ticker: r.ticker_symbol,
                shares: r.shares,
                price_per_share: r.price_per_share,
                total_value: r.total_value,
                notes: r.notes,
            },
        }
    }
}

impl From<&NewTransaction> for TransactionRow {
    fn from(t: &NewTransaction) -> Self {
        Self {
            id: String::new(),
            user_id: t.owner.clone(),
            txn_date: t.date,
            txn_type: t.kind,
            ticker_symbol: t.ticker.clone(),
            shares: t.shares,
            price_per_share: t.price_per_share,
            total_value: t.total_value,
            notes: t.notes.clone(),
        }
    }
}

impl SupabaseStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn table(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn check(response: Response) -> Result<Response, PersistenceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PersistenceError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, PersistenceError> {
        let response = Self::check(request.send().await?).await?;
        Ok(response.json::<Vec<T>>().await?)
    }
}

#[async_trait]
impl PortfolioStore for SupabaseStore {
    async fn save_portfolio(&self, portfolio: &SavedPortfolio) -> Result<(), PersistenceError> {
        let request = self
            .table(reqwest::Method::POST, SAVED_TABLE)
            .json(&[SavedRow::from(portfolio)]);
        let _ = Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn list_portfolios(&self, owner: &str) -> Result<Vec<SavedPortfolio>, PersistenceError> {
        let request = self
            .table(reqwest::Method::GET, SAVED_TABLE)
            .query(&[("user_id", format!("eq.{owner}")), ("select", "*".into())]);
        let rows: Vec<SavedRow> = self.fetch(request).await?;
        Ok(rows.into_iter().map(SavedPortfolio::from).collect())
    }

    async fn delete_portfolio(&self, owner: &str, name: &str) -> Result<usize, PersistenceError> {
        let request = self
            .table(reqwest::Method::DELETE, SAVED_TABLE)
            .header("Prefer", "return=representation")
            .query(&[
                ("user_id", format!("eq.{owner}")),
                ("port_name", format!("eq.{name}")),
            ]);
        let deleted: Vec<Value> = self.fetch(request).await?;
        Ok(deleted.len())
    }

    async fn positions(&self, owner: &str) -> Result<Vec<Position>, PersistenceError> {
        let request = self.table(reqwest::Method::GET, POSITIONS_TABLE).query(&[
            ("user_id", format!("eq.{owner}")),
            ("select", "ticker_symbol,share_count".into()),
        ]);
        let rows: Vec<PositionRow> = self.fetch(request).await?;
        Ok(rows
            .into_iter()
            .map(|r| Position {
                ticker: r.ticker_symbol,
                share_count: r.share_count,
            })
            .collect())
    }

    async fn adjust_shares(
        &self,
        owner: &str,
        ticker: &str,
        delta: f64,
    ) -> Result<f64, PersistenceError> {
        let request = self
            .client
            .post(format!("{}/rest/v1/rpc/{ADJUST_SHARES_RPC}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "p_user_id": owner,
                "p_ticker": ticker,
                "p_delta": round_shares(delta),
            }));
        let response = Self::check(request.send().await?).await?;
        let adjusted: AdjustedShares = response.json().await?;
        if !adjusted.applied {
            return Err(PersistenceError::InsufficientShares {
                ticker: ticker.to_string(),
                owned: adjusted.share_count,
                requested: -delta,
            });
        }
        Ok(adjusted.share_count)
    }

    async fn cash(&self, owner: &str) -> Result<f64, PersistenceError> {
        let request = self.table(reqwest::Method::GET, CASH_TABLE).query(&[
            ("user_id", format!("eq.{owner}")),
            ("select", "cash_amount".into()),
        ]);
        let rows: Vec<CashRow> = self.fetch(request).await?;
        Ok(rows.first().map_or(0.0, |r| r.cash_amount))
    }

    async fn set_cash(&self, owner: &str, amount: f64) -> Result<(), PersistenceError> {
        let request = self
            .table(reqwest::Method::POST, CASH_TABLE)
            .header("Prefer", "resolution=merge-duplicates")
            .query(&[("on_conflict", "user_id")])
            .json(&json!({ "user_id": owner, "cash_amount": amount }));
        let _ = Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn record_transaction(
        &self,
        txn: NewTransaction,
    ) -> Result<Transaction, PersistenceError> {
        let request = self
            .table(reqwest::Method::POST, TRANSACTIONS_TABLE)
            .header("Prefer", "return=representation")
            .json(&[TransactionRow::from(&txn)]);
        let rows: Vec<TransactionRow> = self.fetch(request).await?;
        rows.into_iter()
            .next()
            .map(Transaction::from)
            .ok_or_else(|| PersistenceError::Decode("insert returned no row".into()))
    }

    async fn transactions(&self, owner: &str) -> Result<Vec<Transaction>, PersistenceError> {
        let request = self
            .table(reqwest::Method::GET, TRANSACTIONS_TABLE)
            .query(&[
                ("user_id", format!("eq.{owner}")),
                ("order", "txn_date.asc".into()),
            ]);
        let rows: Vec<TransactionRow> = self.fetch(request).await?;
        Ok(rows.into_iter().map(Transaction::from).collect())
    }

    async fn delete_transaction(&self, owner: &str, id: &str) -> Result<(), PersistenceError> {
        let request = self
            .table(reqwest::Method::DELETE, TRANSACTIONS_TABLE)
            .header("Prefer", "return=representation")
            .query(&[("user_id", format!("eq.{owner}")), ("id", format!("eq.{id}"))]);
        let deleted: Vec<Value> = self.fetch(request).await?;
        if deleted.is_empty() {
            return Err(PersistenceError::NotFound(format!("transaction {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_saved_row_round_trip() {
        let portfolio = SavedPortfolio {
            owner: "user-1".into(),
            name: "core".into(),
            tickers: vec!["VTI".into(), "BND".into()],
            weights: vec![0.6000000000000001, 0.3999999999999999],
            metrics: PortfolioMetrics {
                expected_return: 0.081,
                volatility: 0.123,
                sharpe_ratio: 0.49,
            },
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap(),
        };

        let json = serde_json::to_string(&SavedRow::from(&portfolio)).unwrap();
        assert!(json.contains("\"port_name\":\"core\""));
        let back: SavedRow = serde_json::from_str(&json).unwrap();
        assert_eq!(SavedPortfolio::from(back), portfolio);
    }

    #[test]
    fn test_rows_accept_string_numbers() {
        let rows: Vec<PositionRow> = serde_json::from_str(
            r#"[{"ticker_symbol":"AAPL","share_count":"12.5"},{"ticker_symbol":"MSFT","share_count":3}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].share_count, 12.5);
        assert_eq!(rows[1].share_count, 3.0);

        let txn: TransactionRow = serde_json::from_str(
            r#"{"id":42,"user_id":"u","txn_date":"2024-01-02T15:04:05Z","txn_type":"Sell",
                "ticker_symbol":"AAPL","shares":"1","price_per_share":190.5,
                "total_value":190.5,"notes":"N/A"}"#,
        )
        .unwrap();
        let txn = Transaction::from(txn);
        assert_eq!(txn.id, "42");
        assert_eq!(txn.details.kind, TransactionKind::Sell);
    }

    #[test]
    fn test_transaction_row_omits_id() {
        let row = TransactionRow::from(&NewTransaction {
            owner: "u".into(),
            date: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            kind: TransactionKind::Buy,
            ticker: "AAPL".into(),
            shares: 1.0,
            price_per_share: 10.0,
            total_value: 10.0,
            notes: "N/A".into(),
        });
        let value = serde_json::to_value(&row).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["txn_type"], "Buy");
    }

    #[test]
    fn test_share_update_function_locks_before_reading() {
        let sql = include_str!("../../resources/supabase/adjust_share_count.sql");
        assert!(sql.contains(&format!("function {ADJUST_SHARES_RPC}(")));

        // The lock must cover tickers with no row yet, so it precedes the read.
        let lock = sql.find("pg_advisory_xact_lock").unwrap();
        let read = sql.find("select share_count").unwrap();
        assert!(lock < read);
        assert!(sql.contains("on conflict (user_id, ticker_symbol)"));
    }
}
