use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Task name under which order deductions travel through the queue.
pub const DEDUCT_STOCK_TASK: &str = "order:deduct_stock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    /// 1 for the first hand-off, incremented on every redelivery.
    #[serde(default = "first_delivery")]
    pub delivery: u32,
    pub created_at: DateTime<Utc>,
}

fn first_delivery() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReply {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub quantity: i64,
}

/// Unit of work carried by `order:deduct_stock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductStockPayload {
    pub tenant_id: i64,
    pub warehouse_id: i64,
    pub items: Vec<OrderItem>,
}

/// Body accepted from clients; the tenant comes from the query string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub warehouse_id: i64,
    pub items: Vec<OrderItem>,
}

impl Task {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            delivery: 1,
            created_at: Utc::now(),
        }
    }

    pub fn deduct_stock(payload: &DeductStockPayload) -> serde_json::Result<Self> {
        Ok(Self::new(DEDUCT_STOCK_TASK, serde_json::to_value(payload)?))
    }

    /// Same task, handed out once more.
    pub fn redelivered(&self) -> Self {
        Self {
            delivery: self.delivery + 1,
            ..self.clone()
        }
    }
}

impl TaskReply {
    pub fn success(task_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status: TaskStatus::Succeeded,
            result,
            error: None,
            retryable: false,
            created_at: Utc::now(),
        }
    }

    pub fn failed(task_id: Uuid, error: String, retryable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error),
            retryable,
            created_at: Utc::now(),
        }
    }
}

impl DeductStockPayload {
    pub fn from_request(tenant_id: i64, request: OrderRequest) -> Self {
        Self {
            tenant_id,
            warehouse_id: request.warehouse_id,
            items: request.items,
        }
    }

    /// Checks the shape of the payload before it is enqueued or applied.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id <= 0 {
            return Err(format!("invalid tenant_id {}", self.tenant_id));
        }
        if self.warehouse_id <= 0 {
            return Err(format!("invalid warehouse_id {}", self.warehouse_id));
        }
        if self.items.is_empty() {
            return Err("items must not be empty".to_string());
        }
        for item in &self.items {
            if item.product_id <= 0 {
                return Err(format!("invalid product_id {}", item.product_id));
            }
            if item.quantity <= 0 {
                return Err(format!(
                    "quantity for product_id {} must be positive, got {}",
                    item.product_id, item.quantity
                ));
            }
        }
        Ok(())
    }

    /// Message key that keeps one warehouse's tasks on one partition.
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.warehouse_id)
    }
}
