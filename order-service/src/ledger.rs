//! Per-(product, size) stock counters.
//!
//! Every write goes through [`adjust`], which is a single
//! `UPDATE ... SET quantity = quantity + $delta RETURNING quantity` so the
//! read-modify-write happens inside Postgres and concurrent adjustments on the
//! same key serialize on the row lock.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::fmt;

use crate::schema::stock_ledger;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StockKey {
    pub product_id: String,
    pub size: String,
}

impl StockKey {
    pub fn new(product_id: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            size: size.into(),
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_id, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("no stock ledger entry for {0}")]
    MissingEntry(StockKey),
    #[error("stock ledger update for {key} failed: {message}")]
    Database { key: StockKey, message: String },
}

/// Outcome of one line item's stock adjustment inside a materialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub key: StockKey,
    pub delta: i32,
    pub outcome: Result<i32, LedgerError>,
}

impl Adjustment {
    /// Quantities may go negative; the order still stands, the shortfall is
    /// surfaced for whoever handles stock.
    pub fn is_oversold(&self) -> bool {
        matches!(self.outcome, Ok(quantity) if quantity < 0)
    }
}

/// Atomically applies `delta` to the entry for `key` and returns the new
/// quantity.
///
/// Runs in a nested transaction, so when called inside an outer transaction a
/// failure rolls back to a savepoint and leaves the outer transaction usable.
pub async fn adjust(
    conn: &mut AsyncPgConnection,
    key: &StockKey,
    delta: i32,
) -> Result<i32, LedgerError> {
    let product_id = key.product_id.clone();
    let size = key.size.clone();

    let updated = conn
        .transaction::<_, diesel::result::Error, _>(|conn| {
            Box::pin(async move {
                diesel::update(
                    stock_ledger::table
                        .filter(stock_ledger::product_id.eq(product_id))
                        .filter(stock_ledger::size.eq(size)),
                )
                .set(stock_ledger::quantity.eq(stock_ledger::quantity + delta))
                .returning(stock_ledger::quantity)
                .get_result::<i32>(conn)
                .await
                .optional()
            })
        })
        .await
        .map_err(|e| LedgerError::Database {
            key: key.clone(),
            message: e.to_string(),
        })?;

    updated.ok_or_else(|| LedgerError::MissingEntry(key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_result_is_oversold() {
        let key = StockKey::new("shoe-1", "M");
        let oversold = Adjustment {
            key: key.clone(),
            delta: -3,
            outcome: Ok(-1),
        };
        let exact = Adjustment {
            key: key.clone(),
            delta: -3,
            outcome: Ok(0),
        };
        let missing = Adjustment {
            key: key.clone(),
            delta: -3,
            outcome: Err(LedgerError::MissingEntry(key)),
        };

        assert!(oversold.is_oversold());
        assert!(!exact.is_oversold());
        assert!(!missing.is_oversold());
    }

    #[test]
    fn stock_key_displays_product_and_size() {
        let key = StockKey::new("sock-7", "L");
        assert_eq!(key.to_string(), "sock-7/L");
        assert_eq!(
            LedgerError::MissingEntry(key).to_string(),
            "no stock ledger entry for sock-7/L"
        );
    }
}
