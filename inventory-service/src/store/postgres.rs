use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{StockStore, StockTransaction};
use crate::error::FulfillmentError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConnection = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

const BEGIN_SERIALIZABLE: &str = "BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE READ WRITE";

#[derive(Clone)]
pub struct PgStockStore {
    pool: DbPool,
}

impl PgStockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, FulfillmentError> {
        let mut conn = self.pool.get_owned().await?;
        AnsiTransactionManager::begin_transaction_sql(&mut *conn, BEGIN_SERIALIZABLE).await?;
        Ok(PgTransaction { conn, finished: false })
    }
}

/// An open serializable transaction holding its pooled connection.
///
/// Dropping it without `commit` or `rollback` leaves the connection inside a
/// transaction; the pool then refuses to reuse it and closes it, and Postgres
/// rolls the work back when the session ends.
pub struct PgTransaction {
    conn: PooledConnection,
    finished: bool,
}

#[async_trait]
impl StockTransaction for PgTransaction {
    async fn find_stock(&mut self, key: StockKey) -> Result<Option<StockRecord>, FulfillmentError> {
        let record = stock::table
            .filter(stock::tenant_id.eq(key.tenant_id))
            .filter(stock::warehouse_id.eq(key.warehouse_id))
            .filter(stock::product_id.eq(key.product_id))
            .first::<StockRecord>(&mut *self.conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn insert_stock(&mut self, record: NewStockRecord) -> Result<StockRecord, FulfillmentError> {
        diesel::insert_into(stock::table)
            .values(&record)
            .get_result::<StockRecord>(&mut *self.conn)
            .await
            .map_err(|e| match e {
                // a concurrent transaction created the same triple first
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                    FulfillmentError::TransientConflict(info.message().to_string())
                }
                other => other.into(),
            })
    }

    async fn update_levels(&mut self, stock_id: i64, levels: Levels) -> Result<(), FulfillmentError> {
        diesel::update(stock::table.find(stock_id))
            .set((
                stock::quantity.eq(levels.quantity),
                stock::reserve.eq(levels.reserve),
                stock::on_hand.eq(levels.on_hand),
                stock::updated_at.eq(Utc::now()),
            ))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn append_ledger(&mut self, entry: NewLedgerEntry) -> Result<(), FulfillmentError> {
        diesel::insert_into(transaction_ledger::table)
            .values(&entry)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn is_task_processed(&mut self, task_id: Uuid) -> Result<bool, FulfillmentError> {
        let found = processed_tasks::table
            .find(task_id)
            .select(processed_tasks::task_id)
            .first::<Uuid>(&mut *self.conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    async fn mark_task_processed(&mut self, task: ProcessedTask) -> Result<(), FulfillmentError> {
        diesel::insert_into(processed_tasks::table)
            .values(&task)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                    FulfillmentError::TransientConflict(info.message().to_string())
                }
                other => other.into(),
            })?;
        Ok(())
    }

    async fn commit(mut self) -> Result<(), FulfillmentError> {
        self.finished = true;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(
            &mut *self.conn,
        )
        .await?;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), FulfillmentError> {
        self.finished = true;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(
            &mut *self.conn,
        )
        .await?;
        debug!("transaction rolled back");
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!("transaction dropped while open, discarding its connection");
        }
    }
}
