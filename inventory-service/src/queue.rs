//! Kafka side of the task queue: publishing, consuming and acknowledging.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::Serialize;
use shared::Task;
use tracing::{error, info, warn, Instrument};

use crate::error::FulfillmentError;
use crate::handlers::{decode_task, reply_for, Completion, TaskConsumer};
use crate::retry::{BackoffStrategy, RetryPolicy, Sleeper, TokioSleeper};
use crate::store::StockStore;

/// Sends one message to a topic.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()>;
}

#[derive(Clone)]
pub struct TaskPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl TaskPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer, timeout: Duration::from_secs(5) }
    }

    pub async fn publish<T: Serialize>(&self, topic: &str, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        self.send(topic, Some(key), &json).await
    }
}

#[async_trait]
impl Publish for TaskPublisher {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish to {}: {}", topic, e))?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub task_topic: String,
    pub reply_topic: String,
    pub dead_letter_topic: String,
    /// Deliveries a task gets before it is dead-lettered
    pub max_deliveries: u32,
    /// Tasks handled at the same time
    pub concurrency: usize,
}

/// What happens to a task message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    Redeliver,
    DeadLetter,
}

impl Disposition {
    pub fn for_outcome(outcome: &Result<Completion, FulfillmentError>, delivery: u32, max_deliveries: u32) -> Self {
        match outcome {
            Ok(_) => Disposition::Acknowledge,
            Err(e) if e.is_redeliverable() && delivery < max_deliveries => Disposition::Redeliver,
            Err(_) => Disposition::DeadLetter,
        }
    }
}

/// Committable position per partition.
///
/// Messages finish out of order under concurrent handling. The position
/// handed back never moves past the lowest offset still in flight, so a
/// restart re-reads every message that was not fully settled.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    pub fn begin(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Marks `offset` settled and returns the next offset to commit, if it
    /// moved forward.
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        state.in_flight.remove(&offset);
        state.highest_done = Some(state.highest_done.map_or(offset, |done| done.max(offset)));

        let position = match state.in_flight.first() {
            Some(&lowest) => lowest,
            None => state.highest_done? + 1,
        };
        if state.committed.map_or(true, |committed| position > committed) {
            state.committed = Some(position);
            Some(position)
        } else {
            None
        }
    }
}

const PUBLISH_BACKOFF_BASE: Duration = Duration::from_millis(200);
const PUBLISH_BACKOFF_MAX: Duration = Duration::from_secs(10);

pub struct QueueWorker<S, Z = TokioSleeper, P = TaskPublisher> {
    consumer: Arc<TaskConsumer<S, Z>>,
    publisher: P,
    settings: QueueSettings,
    sleeper: Z,
    publish_backoff: RetryPolicy,
}

impl<S: StockStore, P: Publish> QueueWorker<S, TokioSleeper, P> {
    pub fn new(consumer: TaskConsumer<S, TokioSleeper>, publisher: P, settings: QueueSettings) -> Self {
        Self::with_sleeper(consumer, publisher, settings, TokioSleeper)
    }
}

impl<S: StockStore, Z: Sleeper, P: Publish> QueueWorker<S, Z, P> {
    pub fn with_sleeper(consumer: TaskConsumer<S, Z>, publisher: P, settings: QueueSettings, sleeper: Z) -> Self {
        Self {
            consumer: Arc::new(consumer),
            publisher,
            settings,
            sleeper,
            publish_backoff: RetryPolicy::new(u32::MAX, PUBLISH_BACKOFF_BASE, BackoffStrategy::Exponential)
                .with_max_delay(PUBLISH_BACKOFF_MAX),
        }
    }

    /// Handles messages until the stream ends, at most `concurrency` at once.
    ///
    /// A message counts as settled once its reply and any redelivery or
    /// dead-letter copy are published. Offsets are committed through an
    /// [`OffsetTracker`], so a crash hands every unsettled task out again.
    pub async fn run(&self, consumer: StreamConsumer) {
        let consumer = &consumer;
        let tracker = &Mutex::new(OffsetTracker::default());

        consumer
            .stream()
            .for_each_concurrent(self.settings.concurrency.max(1), |message| {
                if let Ok(m) = &message {
                    lock(tracker).begin(m.topic(), m.partition(), m.offset());
                }
                async move {
                    let m = match message {
                        Ok(m) => m,
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                            return;
                        }
                    };
                    self.process(m.payload()).await;

                    let next = lock(tracker).complete(m.topic(), m.partition(), m.offset());
                    if let Some(next) = next {
                        let mut offsets = TopicPartitionList::new();
                        let committed = offsets
                            .add_partition_offset(m.topic(), m.partition(), Offset::Offset(next))
                            .and_then(|()| consumer.commit(&offsets, CommitMode::Async));
                        if let Err(e) = committed {
                            error!(partition = m.partition(), offset = next, "Error committing offset: {}", e);
                        }
                    }
                }
            })
            .await;
    }

    async fn process(&self, payload: Option<&[u8]>) {
        let Some(raw) = payload else {
            warn!("Skipping message without payload");
            return;
        };

        let task = match decode_task(raw) {
            Ok(task) => task,
            Err(e) => {
                error!("Dead-lettering undecodable message: {}", e);
                self.deliver(&self.settings.dead_letter_topic, None, raw).await;
                return;
            }
        };

        let span = tracing::info_span!(
            "task",
            task_id = %task.id,
            name = %task.name,
            delivery = task.delivery
        );
        self.settle(task).instrument(span).await
    }

    async fn settle(&self, task: Task) {
        let outcome = self.consumer.handle(&task).await;
        let key = task.id.to_string();

        self.deliver_json(&self.settings.reply_topic, &key, &reply_for(task.id, &outcome))
            .await;

        match Disposition::for_outcome(&outcome, task.delivery, self.settings.max_deliveries) {
            Disposition::Acknowledge => {}
            Disposition::Redeliver => {
                let next = task.redelivered();
                info!(next_delivery = next.delivery, "Requeueing task");
                self.deliver_json(&self.settings.task_topic, &key, &next).await;
            }
            Disposition::DeadLetter => {
                warn!("Dead-lettering task");
                self.deliver_json(&self.settings.dead_letter_topic, &key, &task).await;
            }
        }
    }

    async fn deliver_json<T: Serialize + Sync>(&self, topic: &str, key: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(json) => self.deliver(topic, Some(key), &json).await,
            Err(e) => error!(topic, "Failed to serialize message: {}", e),
        }
    }

    /// Publishes until the broker accepts the message.
    async fn deliver(&self, topic: &str, key: Option<&str>, payload: &[u8]) {
        let mut attempt = 1;
        while let Err(e) = self.publisher.send(topic, key, payload).await {
            let delay = self.publish_backoff.delay_for_attempt(attempt);
            warn!(topic, attempt, delay_ms = delay.as_millis() as u64, "Publish failed, retrying: {}", e);
            self.sleeper.sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

fn lock(tracker: &Mutex<OffsetTracker>) -> std::sync::MutexGuard<'_, OffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn completed() -> Result<Completion, FulfillmentError> {
        Ok(Completion { task_id: Uuid::new_v4(), attempts: 1, ledger_entries: 2, replayed: false })
    }

    #[test]
    fn success_is_acknowledged() {
        assert_eq!(Disposition::for_outcome(&completed(), 1, 3), Disposition::Acknowledge);
    }

    #[test]
    fn redeliverable_failures_requeue_until_the_limit() {
        let exhausted = Err(FulfillmentError::ConflictExhausted { attempts: 5 });
        assert_eq!(Disposition::for_outcome(&exhausted, 1, 3), Disposition::Redeliver);
        assert_eq!(Disposition::for_outcome(&exhausted, 2, 3), Disposition::Redeliver);
        assert_eq!(Disposition::for_outcome(&exhausted, 3, 3), Disposition::DeadLetter);

        let down = Err(FulfillmentError::ConnectionFailure("pool timed out".into()));
        assert_eq!(Disposition::for_outcome(&down, 1, 3), Disposition::Redeliver);
    }

    #[test]
    fn business_failures_go_straight_to_dead_letter() {
        let short = Err(FulfillmentError::InsufficientStock { product_id: 9, available: 40, requested: 50 });
        assert_eq!(Disposition::for_outcome(&short, 1, 3), Disposition::DeadLetter);

        let malformed = Err(FulfillmentError::MalformedPayload("items must not be empty".into()));
        assert_eq!(Disposition::for_outcome(&malformed, 1, 3), Disposition::DeadLetter);
    }

    #[test]
    fn offsets_never_pass_an_unsettled_message() {
        let mut tracker = OffsetTracker::default();
        for offset in 5..=7 {
            tracker.begin("order-tasks", 0, offset);
        }
        tracker.begin("order-tasks", 1, 40);

        // 6 finishing first must not commit past 5
        assert_eq!(tracker.complete("order-tasks", 0, 6), None);
        assert_eq!(tracker.complete("order-tasks", 0, 5), Some(7));
        assert_eq!(tracker.complete("order-tasks", 1, 40), Some(41));
        assert_eq!(tracker.complete("order-tasks", 0, 7), Some(8));

        tracker.begin("order-tasks", 0, 8);
        tracker.begin("order-tasks", 0, 9);
        assert_eq!(tracker.complete("order-tasks", 0, 9), None);
        assert_eq!(tracker.complete("order-tasks", 0, 8), Some(10));
    }

    #[test]
    fn unknown_partitions_have_nothing_to_commit() {
        let mut tracker = OffsetTracker::default();
        assert_eq!(tracker.complete("order-tasks", 3, 1), None);
    }

    mod worker {
        use super::*;
        use crate::models::StockKey;
        use crate::mutation::MissingStockPolicy;
        use crate::retry::{RecordingSleeper, RetryLoop};
        use crate::store::MemoryStockStore;
        use shared::{DeductStockPayload, OrderItem, TaskReply, TaskStatus};

        /// Rejects the first `failures` sends, then records every message.
        #[derive(Default)]
        struct FlakyPublisher {
            failures: Mutex<u32>,
            sent: Mutex<Vec<(String, Vec<u8>)>>,
        }

        impl FlakyPublisher {
            fn failing(failures: u32) -> Self {
                Self { failures: Mutex::new(failures), ..Default::default() }
            }

            fn sent_to(&self, topic: &str) -> Vec<Vec<u8>> {
                self.sent
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(t, _)| t == topic)
                    .map(|(_, payload)| payload.clone())
                    .collect()
            }
        }

        #[async_trait]
        impl Publish for FlakyPublisher {
            async fn send(&self, topic: &str, _key: Option<&str>, payload: &[u8]) -> Result<()> {
                {
                    let mut failures = self.failures.lock().unwrap();
                    if *failures > 0 {
                        *failures -= 1;
                        anyhow::bail!("broker unavailable");
                    }
                }
                self.sent.lock().unwrap().push((topic.to_string(), payload.to_vec()));
                Ok(())
            }
        }

        fn settings() -> QueueSettings {
            QueueSettings {
                task_topic: "order-tasks".into(),
                reply_topic: "order-task-replies".into(),
                dead_letter_topic: "order-tasks-dead".into(),
                max_deliveries: 3,
                concurrency: 1,
            }
        }

        fn worker(
            store: &MemoryStockStore,
            publisher: FlakyPublisher,
            sleeper: RecordingSleeper,
        ) -> QueueWorker<MemoryStockStore, RecordingSleeper, FlakyPublisher> {
            let consumer = TaskConsumer::new(
                store.clone(),
                RetryLoop::with_sleeper(RetryPolicy::default(), RecordingSleeper::default()),
                MissingStockPolicy::Reject,
            );
            QueueWorker::with_sleeper(consumer, publisher, settings(), sleeper)
        }

        fn deduct(quantity: i64) -> Vec<u8> {
            let task = Task::deduct_stock(&DeductStockPayload {
                tenant_id: 1,
                warehouse_id: 1,
                items: vec![OrderItem { product_id: 9, quantity }],
            })
            .unwrap();
            serde_json::to_vec(&task).unwrap()
        }

        #[tokio::test]
        async fn reply_is_published_once_the_broker_recovers() {
            let store = MemoryStockStore::new();
            store.seed(StockKey::new(1, 1, 9), 100);
            let sleeper = RecordingSleeper::default();
            let worker = worker(&store, FlakyPublisher::failing(2), sleeper.clone());

            worker.process(Some(&deduct(30))).await;

            let replies = worker.publisher.sent_to("order-task-replies");
            assert_eq!(replies.len(), 1);
            let reply: TaskReply = serde_json::from_slice(&replies[0]).unwrap();
            assert_eq!(reply.status, TaskStatus::Succeeded);
            assert_eq!(
                sleeper.slept(),
                vec![Duration::from_millis(200), Duration::from_millis(400)]
            );
            assert_eq!(store.stock(StockKey::new(1, 1, 9)).unwrap().quantity, 70);
        }

        #[tokio::test]
        async fn failed_task_is_requeued_despite_publish_errors() {
            let store = MemoryStockStore::new();
            store.seed(StockKey::new(1, 1, 9), 100);
            store.inject_conflicts(5);
            let sleeper = RecordingSleeper::default();
            let worker = worker(&store, FlakyPublisher::failing(3), sleeper.clone());

            worker.process(Some(&deduct(30))).await;

            assert_eq!(worker.publisher.sent_to("order-task-replies").len(), 1);
            let requeued = worker.publisher.sent_to("order-tasks");
            assert_eq!(requeued.len(), 1);
            let task: Task = serde_json::from_slice(&requeued[0]).unwrap();
            assert_eq!(task.delivery, 2);
            assert_eq!(sleeper.slept().len(), 3);
            assert!(worker.publisher.sent_to("order-tasks-dead").is_empty());
        }

        #[tokio::test]
        async fn undecodable_messages_reach_the_dead_letter_topic() {
            let store = MemoryStockStore::new();
            let worker = worker(&store, FlakyPublisher::failing(1), RecordingSleeper::default());

            worker.process(Some(b"{not json")).await;

            assert_eq!(worker.publisher.sent_to("order-tasks-dead"), vec![b"{not json".to_vec()]);
            assert!(worker.publisher.sent_to("order-task-replies").is_empty());
        }
    }
}
