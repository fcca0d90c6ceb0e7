//! Stock fulfillment engine: applies order deductions to per-warehouse stock
//! under serializable transactions and records every change in an
//! append-only ledger.

pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod mutation;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod store;
pub mod telemetry;

pub use error::FulfillmentError;
