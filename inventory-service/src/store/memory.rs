use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{StockStore, StockTransaction};
use crate::error::FulfillmentError;
use crate::models::*;

/// In-process test double with serializable, first-committer-wins semantics.
///
/// Every read records the version of the row it saw (or its absence). At
/// commit, a transaction whose reads are stale fails with
/// [`FulfillmentError::TransientConflict`], the same way Postgres aborts the
/// second of two transactions that touched the same row.
#[derive(Clone, Default)]
pub struct MemoryStockStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    next_stock_id: i64,
    next_ledger_id: i64,
    rows: HashMap<StockKey, VersionedRow>,
    ledger: Vec<LedgerEntry>,
    processed: HashMap<Uuid, ProcessedTask>,
    injected_conflicts: u32,
    commits: u64,
    rollbacks: u64,
}

struct VersionedRow {
    record: StockRecord,
    version: u64,
}

impl MemoryState {
    fn allocate_stock_id(&mut self) -> i64 {
        self.next_stock_id += 1;
        self.next_stock_id
    }

    fn key_of(&self, stock_id: i64) -> Option<StockKey> {
        self.rows
            .values()
            .find(|row| row.record.id == stock_id)
            .map(|row| row.record.key())
    }
}

impl MemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a committed row in place without going through a transaction.
    pub fn seed(&self, key: StockKey, quantity: i64) -> StockRecord {
        let mut state = self.lock();
        let id = state.allocate_stock_id();
        let now = Utc::now();
        let record = StockRecord {
            id,
            tenant_id: key.tenant_id,
            warehouse_id: key.warehouse_id,
            product_id: key.product_id,
            minimum: 0,
            quantity,
            reserve: 0,
            on_hand: on_hand(quantity, 0),
            status: true,
            created_at: now,
            updated_at: now,
        };
        state.rows.insert(key, VersionedRow { record: record.clone(), version: 1 });
        record
    }

    pub fn stock(&self, key: StockKey) -> Option<StockRecord> {
        self.lock().rows.get(&key).map(|row| row.record.clone())
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.lock().ledger.clone()
    }

    pub fn processed_tasks(&self) -> Vec<Uuid> {
        self.lock().processed.keys().copied().collect()
    }

    /// Makes the next `count` commits fail as serialization conflicts.
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().injected_conflicts = count;
    }

    pub fn commits(&self) -> u64 {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.lock().rollbacks
    }
}

#[async_trait]
impl StockStore for MemoryStockStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, FulfillmentError> {
        Ok(MemoryTransaction {
            store: self.clone(),
            row_reads: HashMap::new(),
            task_reads: HashSet::new(),
            writes: HashMap::new(),
            inserted: HashSet::new(),
            ledger: Vec::new(),
            processed: Vec::new(),
        })
    }
}

pub struct MemoryTransaction {
    store: MemoryStockStore,
    /// Version observed per key; `None` means the row was absent.
    row_reads: HashMap<StockKey, Option<u64>>,
    task_reads: HashSet<Uuid>,
    writes: HashMap<StockKey, StockRecord>,
    inserted: HashSet<StockKey>,
    ledger: Vec<NewLedgerEntry>,
    processed: Vec<ProcessedTask>,
}

impl MemoryTransaction {
    fn pending_key(&self, stock_id: i64) -> Option<StockKey> {
        self.writes
            .values()
            .find(|record| record.id == stock_id)
            .map(StockRecord::key)
    }

    fn conflict(reason: impl Into<String>) -> FulfillmentError {
        FulfillmentError::TransientConflict(reason.into())
    }
}

#[async_trait]
impl StockTransaction for MemoryTransaction {
    async fn find_stock(&mut self, key: StockKey) -> Result<Option<StockRecord>, FulfillmentError> {
        if let Some(record) = self.writes.get(&key) {
            return Ok(Some(record.clone()));
        }
        let state = self.store.lock();
        let row = state.rows.get(&key);
        self.row_reads.entry(key).or_insert(row.map(|r| r.version));
        Ok(row.map(|r| r.record.clone()))
    }

    async fn insert_stock(&mut self, record: NewStockRecord) -> Result<StockRecord, FulfillmentError> {
        let key = StockKey::new(record.tenant_id, record.warehouse_id, record.product_id);
        if self.writes.contains_key(&key) {
            return Err(Self::conflict("duplicate key value violates unique constraint"));
        }
        let mut state = self.store.lock();
        if state.rows.contains_key(&key) {
            return Err(Self::conflict("duplicate key value violates unique constraint"));
        }
        let now = Utc::now();
        let created = StockRecord {
            id: state.allocate_stock_id(),
            tenant_id: record.tenant_id,
            warehouse_id: record.warehouse_id,
            product_id: record.product_id,
            minimum: record.minimum,
            quantity: record.quantity,
            reserve: record.reserve,
            on_hand: record.on_hand,
            status: record.status,
            created_at: now,
            updated_at: now,
        };
        drop(state);
        self.inserted.insert(key);
        self.writes.insert(key, created.clone());
        Ok(created)
    }

    async fn update_levels(&mut self, stock_id: i64, levels: Levels) -> Result<(), FulfillmentError> {
        let key = match self.pending_key(stock_id) {
            Some(key) => key,
            None => {
                let state = self.store.lock();
                let key = state
                    .key_of(stock_id)
                    .ok_or_else(|| FulfillmentError::Database(format!("no stock row with id {stock_id}")))?;
                let row = &state.rows[&key];
                self.row_reads.entry(key).or_insert(Some(row.version));
                self.writes.insert(key, row.record.clone());
                key
            }
        };
        if let Some(record) = self.writes.get_mut(&key) {
            record.quantity = levels.quantity;
            record.reserve = levels.reserve;
            record.on_hand = levels.on_hand;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_ledger(&mut self, entry: NewLedgerEntry) -> Result<(), FulfillmentError> {
        self.ledger.push(entry);
        Ok(())
    }

    async fn is_task_processed(&mut self, task_id: Uuid) -> Result<bool, FulfillmentError> {
        if self.processed.iter().any(|task| task.task_id == task_id) {
            return Ok(true);
        }
        let seen = self.store.lock().processed.contains_key(&task_id);
        if !seen {
            self.task_reads.insert(task_id);
        }
        Ok(seen)
    }

    async fn mark_task_processed(&mut self, task: ProcessedTask) -> Result<(), FulfillmentError> {
        if self.store.lock().processed.contains_key(&task.task_id) {
            return Err(Self::conflict("duplicate key value violates unique constraint"));
        }
        self.processed.push(task);
        Ok(())
    }

    async fn commit(self) -> Result<(), FulfillmentError> {
        let mut state = self.store.lock();

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            state.rollbacks += 1;
            return Err(Self::conflict("could not serialize access due to concurrent update"));
        }

        let stale_row = self
            .row_reads
            .iter()
            .any(|(key, seen)| state.rows.get(key).map(|row| row.version) != *seen);
        let stale_insert = self.inserted.iter().any(|key| state.rows.contains_key(key));
        let stale_task = self.task_reads.iter().any(|id| state.processed.contains_key(id));
        if stale_row || stale_insert || stale_task {
            state.rollbacks += 1;
            return Err(Self::conflict("could not serialize access due to read/write dependencies among transactions"));
        }

        if let Some(record) = self.writes.values().find(|record| record.quantity < 0) {
            state.rollbacks += 1;
            return Err(FulfillmentError::Database(format!(
                "new row for stock {} violates check constraint on quantity",
                record.id
            )));
        }

        for (key, record) in self.writes {
            let version = state.rows.get(&key).map_or(1, |row| row.version + 1);
            state.rows.insert(key, VersionedRow { record, version });
        }
        let now = Utc::now();
        for entry in self.ledger {
            state.next_ledger_id += 1;
            let id = state.next_ledger_id;
            state.ledger.push(LedgerEntry {
                id,
                model: entry.model,
                event: entry.event,
                tenant_id: entry.tenant_id,
                product_id: entry.product_id,
                warehouse_id: entry.warehouse_id,
                stock_id: entry.stock_id,
                quantity_old: entry.quantity_old,
                quantity_change: entry.quantity_change,
                quantity_new: entry.quantity_new,
                reserve_old: entry.reserve_old,
                reserve_change: entry.reserve_change,
                reserve_new: entry.reserve_new,
                on_hand_old: entry.on_hand_old,
                on_hand_change: entry.on_hand_change,
                on_hand_new: entry.on_hand_new,
                status: entry.status,
                task_id: entry.task_id,
                created_at: now,
            });
        }
        for task in self.processed {
            state.processed.insert(task.task_id, task);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self) -> Result<(), FulfillmentError> {
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_writer_of_a_row_conflicts() {
        let store = MemoryStockStore::new();
        let key = StockKey::new(1, 1, 9);
        let seeded = store.seed(key, 100);

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.find_stock(key).await.unwrap();
        b.find_stock(key).await.unwrap();
        a.update_levels(seeded.id, Levels::with_quantity(40, 0)).await.unwrap();
        b.update_levels(seeded.id, Levels::with_quantity(50, 0)).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.stock(key).unwrap().quantity, 40);
    }

    #[tokio::test]
    async fn uncommitted_writes_stay_invisible() {
        let store = MemoryStockStore::new();
        let key = StockKey::new(1, 1, 9);
        let seeded = store.seed(key, 10);

        let mut tx = store.begin().await.unwrap();
        tx.update_levels(seeded.id, Levels::with_quantity(3, 0)).await.unwrap();
        assert_eq!(tx.find_stock(key).await.unwrap().unwrap().quantity, 3);
        tx.rollback().await.unwrap();

        assert_eq!(store.stock(key).unwrap().quantity, 10);
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn concurrent_lazy_inserts_conflict() {
        let store = MemoryStockStore::new();
        let key = StockKey::new(2, 1, 5);

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        assert!(a.find_stock(key).await.unwrap().is_none());
        assert!(b.find_stock(key).await.unwrap().is_none());
        a.insert_stock(NewStockRecord::granted(key, 20)).await.unwrap();
        b.insert_stock(NewStockRecord::granted(key, 20)).await.unwrap();

        a.commit().await.unwrap();
        assert!(b.commit().await.unwrap_err().is_transient());
    }
}
