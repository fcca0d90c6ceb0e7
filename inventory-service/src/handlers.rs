use serde::Serialize;
use shared::*;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::FulfillmentError;
use crate::mutation::{DeductStock, MissingStockPolicy};
use crate::retry::{RetryLoop, Sleeper, TokioSleeper};
use crate::store::StockStore;

/// Parses a queue message into a task envelope.
pub fn decode_task(raw: &[u8]) -> Result<Task, FulfillmentError> {
    Ok(serde_json::from_slice::<Task>(raw)?)
}

/// Successful handling of one delivered task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub task_id: Uuid,
    pub attempts: u32,
    pub ledger_entries: usize,
    pub replayed: bool,
}

/// Bridges delivered tasks to the retry loop.
///
/// Holds no mutable state; many deliveries may be handled at once.
pub struct TaskConsumer<S, Z = TokioSleeper> {
    store: S,
    retry: RetryLoop<Z>,
    missing_stock: MissingStockPolicy,
}

impl<S: StockStore, Z: Sleeper> TaskConsumer<S, Z> {
    pub fn new(store: S, retry: RetryLoop<Z>, missing_stock: MissingStockPolicy) -> Self {
        Self { store, retry, missing_stock }
    }

    pub async fn handle(&self, task: &Task) -> Result<Completion, FulfillmentError> {
        match task.name.as_str() {
            DEDUCT_STOCK_TASK => self.handle_deduct_stock(task).await,
            other => {
                warn!("Unsupported task name: {}", other);
                Err(FulfillmentError::MalformedPayload(format!("unsupported task name {other:?}")))
            }
        }
    }

    async fn handle_deduct_stock(&self, task: &Task) -> Result<Completion, FulfillmentError> {
        let payload: DeductStockPayload = serde_json::from_value(task.payload.clone())?;
        payload.validate().map_err(FulfillmentError::MalformedPayload)?;

        let mutation = DeductStock::new(payload, self.missing_stock).for_task(task.id, task.name.as_str());
        let committed = self.retry.run(&self.store, &mutation).await;

        match committed {
            Ok(committed) => {
                let payload = &mutation.payload;
                if committed.output.replayed {
                    info!(
                        tenant_id = payload.tenant_id,
                        warehouse_id = payload.warehouse_id,
                        "Task already processed, acknowledging redelivery"
                    );
                } else {
                    info!(
                        tenant_id = payload.tenant_id,
                        warehouse_id = payload.warehouse_id,
                        items = payload.items.len(),
                        attempts = committed.attempts,
                        "Order processed"
                    );
                }
                Ok(Completion {
                    task_id: task.id,
                    attempts: committed.attempts,
                    ledger_entries: committed.output.entries.len(),
                    replayed: committed.output.replayed,
                })
            }
            Err(e) => {
                match &e {
                    FulfillmentError::ConflictExhausted { .. } | FulfillmentError::ConnectionFailure(_) => {
                        error!(kind = e.kind(), "Order failed: {}", e)
                    }
                    _ => warn!(kind = e.kind(), "Order rejected: {}", e),
                }
                Err(e)
            }
        }
    }
}

/// The acknowledgment sent back for a handled task.
pub fn reply_for(task_id: Uuid, outcome: &Result<Completion, FulfillmentError>) -> TaskReply {
    match outcome {
        Ok(completion) => TaskReply::success(task_id, serde_json::to_value(completion).ok()),
        Err(e) => TaskReply::failed(task_id, e.to_string(), e.is_redeliverable()),
    }
}
