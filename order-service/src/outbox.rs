//! Relays `OrderMaterialized` events from `outbox_events` to Kafka.
//!
//! Rows are written by the materializing transaction and only marked
//! published after the broker acknowledged them, so a crash in between
//! republishes. Consumers key on the order id.

use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{DbOutboxEvent, ORDER_MATERIALIZED};
use crate::schema::outbox_events;

const BATCH_SIZE: i64 = 100;

#[async_trait]
pub trait OutboxSource: Send + Sync {
    /// Unpublished events, oldest first.
    async fn pending(&self, limit: i64) -> Result<Vec<DbOutboxEvent>>;

    async fn mark_published(&self, event_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<()>;
}

pub struct PgOutbox {
    pool: Pool<AsyncPgConnection>,
}

impl PgOutbox {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxSource for PgOutbox {
    async fn pending(&self, limit: i64) -> Result<Vec<DbOutboxEvent>> {
        let mut conn = self.pool.get().await?;
        let events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;
        Ok(events)
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(outbox_events::table.find(event_id))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Kafka rejected record: {}", e))?;
        Ok(())
    }
}

pub struct OutboxRelay<S, K> {
    source: S,
    sink: K,
    order_events_topic: String,
    poll_interval: Duration,
}

impl<S: OutboxSource, K: EventSink> OutboxRelay<S, K> {
    pub fn new(source: S, sink: K, order_events_topic: String) -> Self {
        Self {
            source,
            sink,
            order_events_topic,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub async fn run(&self) {
        let mut ticker = time::interval(self.poll_interval);

        loop {
            ticker.tick().await;

            match self.relay_pending().await {
                Ok(0) => {}
                Ok(published) => debug!(published, "Outbox batch relayed"),
                Err(e) => error!("Outbox relay failed: {:#}", e),
            }
        }
    }

    /// One pass over the pending batch. Returns how many events were
    /// published and marked.
    pub async fn relay_pending(&self) -> Result<usize> {
        let mut published = 0;

        for event in self.source.pending(BATCH_SIZE).await? {
            if event.event_type != ORDER_MATERIALIZED {
                warn!(event_id = %event.id, event_type = %event.event_type, "Skipping outbox event of unknown type");
                continue;
            }

            let payload = serde_json::to_string(&event.event_data)?;
            let key = event.aggregate_id.to_string();
            if let Err(e) = self.sink.send(&self.order_events_topic, &key, &payload).await {
                warn!(event_id = %event.id, order_id = %key, "Publish failed, will retry: {:#}", e);
                continue;
            }

            self.source.mark_published(event.id).await?;
            published += 1;
            info!(event_id = %event.id, order_id = %key, "Published {}", ORDER_MATERIALIZED);
        }

        Ok(published)
    }
}
