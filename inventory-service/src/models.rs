use bigdecimal::BigDecimal;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Identity of a stock row: one row per (tenant, warehouse, product).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub tenant_id: i64,
    pub warehouse_id: i64,
    pub product_id: i64,
}

impl StockKey {
    pub fn new(tenant_id: i64, warehouse_id: i64, product_id: i64) -> Self {
        Self { tenant_id, warehouse_id, product_id }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock)]
pub struct StockRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub warehouse_id: i64,
    pub product_id: i64,
    pub minimum: i64,
    pub quantity: i64,
    pub reserve: i64,
    pub on_hand: i64,
    pub status: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.tenant_id, self.warehouse_id, self.product_id)
    }

    pub fn levels(&self) -> Levels {
        Levels {
            quantity: self.quantity,
            reserve: self.reserve,
            on_hand: self.on_hand,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock)]
pub struct NewStockRecord {
    pub tenant_id: i64,
    pub warehouse_id: i64,
    pub product_id: i64,
    pub minimum: i64,
    pub quantity: i64,
    pub reserve: i64,
    pub on_hand: i64,
    pub status: bool,
}

impl NewStockRecord {
    /// A fresh row holding `quantity` with nothing reserved.
    pub fn granted(key: StockKey, quantity: i64) -> Self {
        Self {
            tenant_id: key.tenant_id,
            warehouse_id: key.warehouse_id,
            product_id: key.product_id,
            minimum: 0,
            quantity,
            reserve: 0,
            on_hand: on_hand(quantity, 0),
            status: true,
        }
    }
}

/// The on-hand figure stored with every write: what is left once reserves are set aside.
pub fn on_hand(quantity: i64, reserve: i64) -> i64 {
    quantity - reserve
}

/// Quantity, reserve and on-hand of a stock row at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Levels {
    pub quantity: i64,
    pub reserve: i64,
    pub on_hand: i64,
}

impl Levels {
    pub fn with_quantity(quantity: i64, reserve: i64) -> Self {
        Self {
            quantity,
            reserve,
            on_hand: on_hand(quantity, reserve),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerModel {
    Order,
    Stock,
}

impl LedgerModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerModel::Order => "ORDER",
            LedgerModel::Stock => "STOCK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Issue,
    Receipt,
}

impl LedgerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEvent::Issue => "ISSUE",
            LedgerEvent::Receipt => "RECEIPT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::transaction_ledger)]
pub struct LedgerEntry {
    pub id: i64,
    pub model: String,
    pub event: String,
    pub tenant_id: i64,
    pub product_id: i64,
    pub warehouse_id: i64,
    pub stock_id: i64,
    pub quantity_old: i64,
    pub quantity_change: i64,
    pub quantity_new: i64,
    pub reserve_old: i64,
    pub reserve_change: i64,
    pub reserve_new: i64,
    pub on_hand_old: i64,
    pub on_hand_change: i64,
    pub on_hand_new: i64,
    pub status: bool,
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize)]
#[diesel(table_name = crate::schema::transaction_ledger)]
pub struct NewLedgerEntry {
    pub model: String,
    pub event: String,
    pub tenant_id: i64,
    pub product_id: i64,
    pub warehouse_id: i64,
    pub stock_id: i64,
    pub quantity_old: i64,
    pub quantity_change: i64,
    pub quantity_new: i64,
    pub reserve_old: i64,
    pub reserve_change: i64,
    pub reserve_new: i64,
    pub on_hand_old: i64,
    pub on_hand_change: i64,
    pub on_hand_new: i64,
    pub status: bool,
    pub task_id: Option<Uuid>,
}

impl NewLedgerEntry {
    /// Describes the move of one stock row from `before` to `after`.
    /// Changes are derived, so `new = old + change` holds for every column.
    pub fn movement(
        model: LedgerModel,
        event: LedgerEvent,
        key: StockKey,
        stock_id: i64,
        before: Levels,
        after: Levels,
        task_id: Option<Uuid>,
    ) -> Self {
        Self {
            model: model.as_str().to_string(),
            event: event.as_str().to_string(),
            tenant_id: key.tenant_id,
            product_id: key.product_id,
            warehouse_id: key.warehouse_id,
            stock_id,
            quantity_old: before.quantity,
            quantity_change: after.quantity - before.quantity,
            quantity_new: after.quantity,
            reserve_old: before.reserve,
            reserve_change: after.reserve - before.reserve,
            reserve_new: after.reserve,
            on_hand_old: before.on_hand,
            on_hand_change: after.on_hand - before.on_hand,
            on_hand_new: after.on_hand,
            status: true,
            task_id,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_tasks)]
pub struct ProcessedTask {
    pub task_id: Uuid,
    pub task_name: String,
    pub result: Option<serde_json::Value>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::tenant)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::tenant)]
pub struct NewTenant {
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::product)]
pub struct Product {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub sku: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::product)]
pub struct NewProduct {
    pub tenant_id: i64,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub sku: String,
}
