//! Storage seam for the stock engine.
//!
//! A [`StockStore`] hands out [`StockTransaction`]s running at serializable
//! isolation. All reads and writes of a mutation go through one transaction,
//! which the caller finishes with exactly one of `commit` or `rollback`.

#[cfg(test)]
mod memory;
mod postgres;

#[cfg(test)]
pub use memory::{MemoryStockStore, MemoryTransaction};
pub use postgres::{DbPool, PgStockStore, PgTransaction};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::FulfillmentError;
use crate::models::{Levels, NewLedgerEntry, NewStockRecord, ProcessedTask, StockKey, StockRecord};

#[async_trait]
pub trait StockTransaction: Send {
    async fn find_stock(&mut self, key: StockKey) -> Result<Option<StockRecord>, FulfillmentError>;

    /// Inserts a new row. A row that already exists for the key surfaces as a
    /// conflict, since a concurrent transaction must have created it.
    async fn insert_stock(&mut self, record: NewStockRecord) -> Result<StockRecord, FulfillmentError>;

    async fn update_levels(&mut self, stock_id: i64, levels: Levels) -> Result<(), FulfillmentError>;

    async fn append_ledger(&mut self, entry: NewLedgerEntry) -> Result<(), FulfillmentError>;

    async fn is_task_processed(&mut self, task_id: Uuid) -> Result<bool, FulfillmentError>;

    async fn mark_task_processed(&mut self, task: ProcessedTask) -> Result<(), FulfillmentError>;

    async fn commit(self) -> Result<(), FulfillmentError>;

    async fn rollback(self) -> Result<(), FulfillmentError>;
}

#[async_trait]
pub trait StockStore: Send + Sync {
    type Tx: StockTransaction;

    /// Acquires a connection and opens a serializable transaction on it.
    async fn begin(&self) -> Result<Self::Tx, FulfillmentError>;
}
