//! Result publication over pub/sub plus a polling-friendly TTL copy (spec
//! §4.D), grounded on
//! `examples/original_source/src/nanogrid_agent/redis_publisher.py`.

use async_trait::async_trait;
use nanogrid_agent_types::ExecutionResult;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::BusError;

/// A channel to push finished results to, abstracted so tests never need a
/// real Redis server.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Publish `payload` on `channel`, returning the subscriber count.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BusError>;

    /// Store `payload` under `key` with a TTL, for pollers that missed the
    /// pub/sub message.
    async fn set_with_ttl(&self, key: &str, payload: &str, ttl_seconds: u64) -> Result<(), BusError>;
}

pub struct RedisNotificationBus {
    connection: Mutex<redis::aio::MultiplexedConnection>,
}

impl RedisNotificationBus {
    /// Connects eagerly and keeps one multiplexed connection for the
    /// process lifetime, mirroring the original's lazily-created but
    /// long-lived `redis.Redis` client.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self, BusError> {
        let auth = if password.is_empty() {
            String::new()
        } else {
            format!(":{password}@")
        };
        let url = format!("redis://{auth}{host}:{port}");
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection: Mutex::new(connection) })
    }
}

#[async_trait]
impl NotificationBus for RedisNotificationBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BusError> {
        let mut conn = self.connection.lock().await;
        let count: u64 = conn.publish(channel, payload).await?;
        Ok(count)
    }

    async fn set_with_ttl(&self, key: &str, payload: &str, ttl_seconds: u64) -> Result<(), BusError> {
        let mut conn = self.connection.lock().await;
        conn.set_ex::<_, _, ()>(key, payload, ttl_seconds).await?;
        Ok(())
    }
}

/// Number of seconds a result stays fetchable by polling clients after a
/// pub/sub publish, matching the original's `timedelta(seconds=600)`.
const JOB_RESULT_TTL_SECONDS: u64 = 600;

pub struct ResultPublisher<B: NotificationBus> {
    pub(crate) bus: B,
    result_prefix: String,
}

impl<B: NotificationBus> ResultPublisher<B> {
    pub fn new(bus: B, result_prefix: impl Into<String>) -> Self {
        Self { bus, result_prefix: result_prefix.into() }
    }

    /// Publish `result` to its pub/sub channel and store a TTL'd copy under
    /// `job:<request_id>`. A publish failure is logged and swallowed — a
    /// task's own outcome must never regress because the notification
    /// side channel is down.
    pub async fn publish_result(&self, result: &ExecutionResult) {
        let request_id = &result.request_id;
        let channel = format!("{}{}", self.result_prefix, request_id);

        let payload = match serde_json::to_string(result) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(request_id, error = %err, "failed to serialize result for publish");
                return;
            }
        };

        match self.bus.publish(&channel, &payload).await {
            Ok(count) if count > 0 => {
                info!(request_id, subscribers = count, "result published");
            }
            Ok(_) => {
                warn!(request_id, channel, "result published but no subscribers");
            }
            Err(err) => {
                warn!(request_id, channel, error = %err, "failed to publish result");
            }
        }

        let job_key = format!("job:{request_id}");
        if let Err(err) = self.bus.set_with_ttl(&job_key, &payload, JOB_RESULT_TTL_SECONDS).await {
            warn!(request_id, key = job_key, error = %err, "failed to save job result");
        }
    }
}
