//! Read-check-write-log against one open transaction.
//!
//! Nothing here commits or rolls back; [`crate::retry::RetryLoop`] owns the
//! transaction boundary and decides what happens to the work afterwards.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use shared::DeductStockPayload;
use tracing::debug;
use uuid::Uuid;

use crate::error::FulfillmentError;
use crate::models::*;
use crate::store::StockTransaction;

/// What a deduction does when no stock row exists for a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStockPolicy {
    /// Fail the whole payload with `StockNotFound`.
    #[default]
    Reject,
    /// Create the row holding the requested amount, recorded as a receipt.
    /// Kept for compatibility with data written by earlier deployments.
    Create,
}

/// One unit of work the retry loop can run against a fresh transaction.
#[async_trait]
pub trait Mutation: Send + Sync {
    type Output: Send;

    async fn apply<T: StockTransaction>(&self, tx: &mut T) -> Result<Self::Output, FulfillmentError>;
}

/// Deducts every line item of an order, optionally tied to a queue task.
#[derive(Debug, Clone)]
pub struct DeductStock {
    pub payload: DeductStockPayload,
    pub policy: MissingStockPolicy,
    pub task: Option<TaskRef>,
}

#[derive(Debug, Clone)]
pub struct TaskRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deduction {
    pub entries: Vec<NewLedgerEntry>,
    /// The task had already been applied by an earlier delivery.
    pub replayed: bool,
}

impl DeductStock {
    pub fn new(payload: DeductStockPayload, policy: MissingStockPolicy) -> Self {
        Self { payload, policy, task: None }
    }

    pub fn for_task(mut self, id: Uuid, name: impl Into<String>) -> Self {
        self.task = Some(TaskRef { id, name: name.into() });
        self
    }
}

#[async_trait]
impl Mutation for DeductStock {
    type Output = Deduction;

    async fn apply<T: StockTransaction>(&self, tx: &mut T) -> Result<Deduction, FulfillmentError> {
        if let Some(task) = &self.task {
            if tx.is_task_processed(task.id).await? {
                debug!(task_id = %task.id, "task already applied, skipping");
                return Ok(Deduction { entries: Vec::new(), replayed: true });
            }
        }

        let task_id = self.task.as_ref().map(|task| task.id);
        let entries = deduct_items(tx, &self.payload, self.policy, task_id).await?;

        if let Some(task) = &self.task {
            tx.mark_task_processed(ProcessedTask {
                task_id: task.id,
                task_name: task.name.clone(),
                result: Some(serde_json::json!({ "ledger_entries": entries.len() })),
                processed_at: Utc::now(),
            })
            .await?;
        }

        Ok(Deduction { entries, replayed: false })
    }
}

/// Applies each line item in order, returning the ledger rows written.
///
/// Repeated product ids compound against the same row. Any failure leaves
/// the transaction dirty; the caller must roll it back.
pub async fn deduct_items<T: StockTransaction + ?Sized>(
    tx: &mut T,
    payload: &DeductStockPayload,
    policy: MissingStockPolicy,
    task_id: Option<Uuid>,
) -> Result<Vec<NewLedgerEntry>, FulfillmentError> {
    let mut entries = Vec::with_capacity(payload.items.len());

    for item in &payload.items {
        let key = StockKey::new(payload.tenant_id, payload.warehouse_id, item.product_id);

        let entry = match tx.find_stock(key).await? {
            Some(current) => {
                if current.quantity < item.quantity {
                    return Err(FulfillmentError::InsufficientStock {
                        product_id: item.product_id,
                        available: current.quantity,
                        requested: item.quantity,
                    });
                }
                let after = Levels::with_quantity(current.quantity - item.quantity, current.reserve);
                tx.update_levels(current.id, after).await?;
                NewLedgerEntry::movement(
                    LedgerModel::Order,
                    LedgerEvent::Issue,
                    key,
                    current.id,
                    current.levels(),
                    after,
                    task_id,
                )
            }
            None => match policy {
                MissingStockPolicy::Reject => {
                    return Err(FulfillmentError::StockNotFound { product_id: item.product_id });
                }
                MissingStockPolicy::Create => {
                    let created = tx.insert_stock(NewStockRecord::granted(key, item.quantity)).await?;
                    NewLedgerEntry::movement(
                        LedgerModel::Order,
                        LedgerEvent::Receipt,
                        key,
                        created.id,
                        Levels::default(),
                        created.levels(),
                        task_id,
                    )
                }
            },
        };

        tx.append_ledger(entry.clone()).await?;
        entries.push(entry);
    }

    Ok(entries)
}

/// A signed, single-row correction: positive receives, negative issues.
#[derive(Debug, Clone, Copy)]
pub struct AdjustStock {
    pub key: StockKey,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Adjustment {
    pub stock_id: i64,
    pub levels: Levels,
    pub entry: NewLedgerEntry,
}

#[async_trait]
impl Mutation for AdjustStock {
    type Output = Adjustment;

    async fn apply<T: StockTransaction>(&self, tx: &mut T) -> Result<Adjustment, FulfillmentError> {
        if self.delta == 0 {
            return Err(FulfillmentError::MalformedPayload("quantity must not be zero".to_string()));
        }
        let event = if self.delta > 0 { LedgerEvent::Receipt } else { LedgerEvent::Issue };

        let (stock_id, before, after) = match tx.find_stock(self.key).await? {
            Some(current) => {
                let quantity = current.quantity.checked_add(self.delta).ok_or_else(|| {
                    FulfillmentError::MalformedPayload(format!("quantity {} overflows", self.delta))
                })?;
                if quantity < 0 {
                    return Err(FulfillmentError::InsufficientStock {
                        product_id: self.key.product_id,
                        available: current.quantity,
                        requested: self.delta.checked_neg().unwrap_or(i64::MAX),
                    });
                }
                let after = Levels::with_quantity(quantity, current.reserve);
                tx.update_levels(current.id, after).await?;
                (current.id, current.levels(), after)
            }
            None if self.delta > 0 => {
                let created = tx.insert_stock(NewStockRecord::granted(self.key, self.delta)).await?;
                (created.id, Levels::default(), created.levels())
            }
            None => {
                return Err(FulfillmentError::StockNotFound { product_id: self.key.product_id });
            }
        };

        let entry = NewLedgerEntry::movement(LedgerModel::Stock, event, self.key, stock_id, before, after, None);
        tx.append_ledger(entry.clone()).await?;
        Ok(Adjustment { stock_id, levels: after, entry })
    }
}
