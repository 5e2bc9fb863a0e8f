//! Log pipeline: two bounded channels, a batched metadata writer, a
//! one-at-a-time body writer, and an hourly TTL sweeper — bounded
//! mpsc queues feeding background batchers, sized for this crate's two
//! tables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sea_orm::{ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::entities::{self, request_body::Column as BodyColumn, request_log::Column as LogColumn};

const METADATA_CHANNEL_CAPACITY: usize = 1000;
const BODY_CHANNEL_CAPACITY: usize = 500;
const METADATA_BATCH_MAX: usize = 10;
const METADATA_BATCH_INTERVAL: Duration = Duration::from_millis(100);
const BODY_RETENTION: time::Duration = time::Duration::days(7);
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub trace_id: String,
    pub request_id: Option<String>,
    pub platform: String,
    pub model: String,
    pub provider: String,
    pub http_status: i32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub reasoning_tokens: i64,
    pub is_stream: bool,
    pub duration_seconds: f64,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub request_method: String,
    pub request_path: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub vendor_error_code: Option<String>,
    pub cost_input: f64,
    pub cost_output: f64,
    pub cost_cache_create: f64,
    pub cost_cache_read: f64,
    pub cost_ephemeral_5m: f64,
    pub cost_ephemeral_1h: f64,
    pub cost_total: f64,
    pub has_pricing: bool,
}

#[derive(Debug, Clone)]
pub struct BodyRecord {
    pub trace_id: String,
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
}

fn truncate(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.truncate(MAX_BODY_BYTES);
    bytes
}

impl From<MetadataRecord> for entities::request_log::ActiveModel {
    fn from(record: MetadataRecord) -> Self {
        entities::request_log::ActiveModel {
            id: ActiveValue::NotSet,
            trace_id: ActiveValue::Set(record.trace_id),
            request_id: ActiveValue::Set(record.request_id),
            platform: ActiveValue::Set(record.platform),
            model: ActiveValue::Set(record.model),
            provider: ActiveValue::Set(record.provider),
            http_status: ActiveValue::Set(record.http_status),
            input_tokens: ActiveValue::Set(record.input_tokens),
            output_tokens: ActiveValue::Set(record.output_tokens),
            cache_creation_input_tokens: ActiveValue::Set(record.cache_creation_input_tokens),
            cache_read_input_tokens: ActiveValue::Set(record.cache_read_input_tokens),
            reasoning_tokens: ActiveValue::Set(record.reasoning_tokens),
            is_stream: ActiveValue::Set(record.is_stream),
            duration_seconds: ActiveValue::Set(record.duration_seconds),
            user_agent: ActiveValue::Set(record.user_agent),
            client_ip: ActiveValue::Set(record.client_ip),
            user_id: ActiveValue::Set(record.user_id),
            request_method: ActiveValue::Set(record.request_method),
            request_path: ActiveValue::Set(record.request_path),
            error_type: ActiveValue::Set(record.error_type),
            error_message: ActiveValue::Set(record.error_message),
            vendor_error_code: ActiveValue::Set(record.vendor_error_code),
            cost_input: ActiveValue::Set(record.cost_input),
            cost_output: ActiveValue::Set(record.cost_output),
            cost_cache_create: ActiveValue::Set(record.cost_cache_create),
            cost_cache_read: ActiveValue::Set(record.cost_cache_read),
            cost_ephemeral_5m: ActiveValue::Set(record.cost_ephemeral_5m),
            cost_ephemeral_1h: ActiveValue::Set(record.cost_ephemeral_1h),
            cost_total: ActiveValue::Set(record.cost_total),
            has_pricing: ActiveValue::Set(record.has_pricing),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        }
    }
}

/// Owns the two channels and the background writers. Dropping every clone of
/// the sender halves lets the writers drain their buffer and exit, which is
/// how graceful shutdown flushes in-flight records without a separate signal.
pub struct LogPipeline {
    metadata_tx: mpsc::Sender<MetadataRecord>,
    body_tx: mpsc::Sender<BodyRecord>,
    dropped: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl LogPipeline {
    pub fn spawn(db: DatabaseConnection, shutdown: CancellationToken) -> Self {
        let (metadata_tx, metadata_rx) = mpsc::channel(METADATA_CHANNEL_CAPACITY);
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        handles.push(tokio::spawn(metadata_writer(db.clone(), metadata_rx)));
        handles.push(tokio::spawn(body_writer(db.clone(), body_rx)));
        handles.push(tokio::spawn(ttl_sweeper(db, shutdown)));

        Self { metadata_tx, body_tx, dropped, handles }
    }

    /// Non-blocking; increments the dropped counter instead of back-pressuring
    /// the dispatcher when the channel is full.
    pub fn enqueue_metadata(&self, record: MetadataRecord) -> bool {
        match self.metadata_tx.try_send(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("metadata channel full, dropping log record");
                false
            }
        }
    }

    pub fn enqueue_body(&self, record: BodyRecord) -> bool {
        match self.body_tx.try_send(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("body channel full, dropping log body");
                false
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drops the sender halves so the writers see channel closure, then waits
    /// for them (and the sweeper) to finish their last flush.
    pub async fn shutdown(self) {
        let LogPipeline { metadata_tx, body_tx, handles, .. } = self;
        drop(metadata_tx);
        drop(body_tx);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn metadata_writer(db: DatabaseConnection, mut rx: mpsc::Receiver<MetadataRecord>) {
    let mut buffer = Vec::with_capacity(METADATA_BATCH_MAX);
    let mut ticker = tokio_time::interval(METADATA_BATCH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= METADATA_BATCH_MAX {
                            flush_metadata(&db, &mut buffer).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            flush_metadata(&db, &mut buffer).await;
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_metadata(&db, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush_metadata(db: &DatabaseConnection, buffer: &mut Vec<MetadataRecord>) {
    let mut batch = Vec::new();
    std::mem::swap(buffer, &mut batch);
    let models = batch.into_iter().map(entities::request_log::ActiveModel::from);

    // A failed batch insert is logged and dropped, never retried — bounded
    // loss beats blocking the dispatcher.
    if let Err(err) = entities::RequestLogs::insert_many(models).exec(db).await {
        tracing::warn!(error = %err, "metadata batch insert failed, records dropped");
    }
}

async fn body_writer(db: DatabaseConnection, mut rx: mpsc::Receiver<BodyRecord>) {
    while let Some(record) = rx.recv().await {
        let now = OffsetDateTime::now_utc();
        let active = entities::request_body::ActiveModel {
            id: ActiveValue::NotSet,
            trace_id: ActiveValue::Set(record.trace_id),
            request_body: ActiveValue::Set(truncate(record.request_body)),
            response_body: ActiveValue::Set(truncate(record.response_body)),
            created_at: ActiveValue::Set(now),
            expires_at: ActiveValue::Set(now + BODY_RETENTION),
        };
        if let Err(err) = entities::RequestBodies::insert(active).exec(&db).await {
            tracing::warn!(error = %err, "body insert failed, record dropped");
        }
    }
}

async fn ttl_sweeper(db: DatabaseConnection, shutdown: CancellationToken) {
    sweep_expired(&db).await;

    let mut ticker = tokio_time::interval(TTL_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; the startup sweep above already covered it

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_expired(&db).await,
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn sweep_expired(db: &DatabaseConnection) {
    let now = OffsetDateTime::now_utc();
    if let Err(err) = entities::RequestBodies::delete_many().filter(BodyColumn::ExpiresAt.lt(now)).exec(db).await {
        tracing::warn!(error = %err, "ttl sweep of request_bodies failed");
    }
}

/// Deletes metadata and body records older than `older_than_days`, for the
/// admin surface's cleanup operation.
pub async fn cleanup_older_than(db: &DatabaseConnection, older_than_days: i64) -> Result<u64, sea_orm::DbErr> {
    let cutoff = OffsetDateTime::now_utc() - time::Duration::days(older_than_days);
    let bodies = entities::RequestBodies::delete_many().filter(BodyColumn::CreatedAt.lt(cutoff)).exec(db).await?;
    let logs = entities::RequestLogs::delete_many().filter(LogColumn::CreatedAt.lt(cutoff)).exec(db).await?;
    Ok(bodies.rows_affected + logs.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect, sync_schema};

    fn sample_metadata(trace_id: &str) -> MetadataRecord {
        MetadataRecord {
            trace_id: trace_id.to_string(),
            request_id: None,
            platform: "claude".to_string(),
            model: "claude-opus-4".to_string(),
            provider: "anthropic-primary".to_string(),
            http_status: 200,
            input_tokens: 1,
            output_tokens: 1,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            reasoning_tokens: 0,
            is_stream: false,
            duration_seconds: 0.1,
            user_agent: None,
            client_ip: None,
            user_id: None,
            request_method: "POST".to_string(),
            request_path: "/v1/messages".to_string(),
            error_type: None,
            error_message: None,
            vendor_error_code: None,
            cost_input: 0.0,
            cost_output: 0.0,
            cost_cache_create: 0.0,
            cost_cache_read: 0.0,
            cost_ephemeral_5m: 0.0,
            cost_ephemeral_1h: 0.0,
            cost_total: 0.0,
            has_pricing: true,
        }
    }

    /// `current_thread` means the metadata writer, though spawned, never gets
    /// polled until this test yields — so filling the channel past capacity
    /// synchronously is deterministic rather than racing the real consumer.
    #[tokio::test(flavor = "current_thread")]
    async fn enqueue_metadata_increments_dropped_counter_once_the_channel_is_full() {
        let db = connect("sqlite::memory:").await.unwrap();
        sync_schema(&db).await.unwrap();
        let pipeline = LogPipeline::spawn(db, CancellationToken::new());

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..METADATA_CHANNEL_CAPACITY + 50 {
            if pipeline.enqueue_metadata(sample_metadata(&format!("trace-{i}"))) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        assert_eq!(rejected, 50, "every record past the channel's capacity is dropped, not queued");
        assert_eq!(accepted, METADATA_CHANNEL_CAPACITY);
        assert_eq!(pipeline.dropped_count(), 50);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_older_than_rejects_nothing_and_returns_zero_on_an_empty_table() {
        let db = connect("sqlite::memory:").await.unwrap();
        sync_schema(&db).await.unwrap();
        let deleted = cleanup_older_than(&db, 7).await.unwrap();
        assert_eq!(deleted, 0);
    }
}
