//! Long-poll queue consumption and the per-message pipeline (spec §4.I),
//! grounded on `examples/original_source/src/nanogrid_agent/sqs_poller.py`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nanogrid_agent_types::{ExecutionResult, RuntimeKind, Task};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::{classify, should_ack, AgentError, QueueError};
use crate::executor::ContainerExecutor;
use crate::fetcher::{CodeFetcher, ObjectStore};
use crate::metrics::{publish_peak_memory, MetricsSink};
use crate::publisher::{NotificationBus, ResultPublisher};

/// A message as delivered by the queue, carrying its raw body so the
/// dispatcher (not the queue client) owns JSON parsing.
pub struct QueueMessage {
    pub body: String,
    pub receipt_handle: String,
}

/// Abstracts SQS long-polling receive/delete, so the dispatcher's pipeline
/// can be tested against an in-memory fake queue.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>, QueueError>;
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self { client, queue_url: queue_url.into() }
    }
}

#[async_trait]
impl Queue for SqsQueue {
    async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait_time_secs as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.into_service_error().to_string()))?;

        Ok(response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                Some(QueueMessage { body: m.body?, receipt_handle: m.receipt_handle? })
            })
            .collect())
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.into_service_error().to_string()))?;
        Ok(())
    }
}

/// Everything a single task run needs beyond the queue itself.
pub struct TaskDispatcher<Q, S, B, M>
where
    Q: Queue,
    S: ObjectStore,
    B: NotificationBus,
    M: MetricsSink,
{
    queue: Q,
    fetcher: CodeFetcher<S>,
    executor: ContainerExecutor<S>,
    publisher: ResultPublisher<B>,
    metrics: M,
    config: AgentConfig,
    running: std::sync::atomic::AtomicBool,
}

impl<Q, S, B, M> TaskDispatcher<Q, S, B, M>
where
    Q: Queue,
    S: ObjectStore,
    B: NotificationBus,
    M: MetricsSink,
{
    pub fn new(
        queue: Q,
        fetcher: CodeFetcher<S>,
        executor: ContainerExecutor<S>,
        publisher: ResultPublisher<B>,
        metrics: M,
        config: AgentConfig,
    ) -> Self {
        Self {
            queue,
            fetcher,
            executor,
            publisher,
            metrics,
            config,
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Request the run loop to stop after its current receive/process
    /// cycle, for use from a signal handler.
    pub fn stop(&self) {
        info!("stopping task dispatcher");
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Long-poll until [`Self::stop`] is called, processing whatever batch
    /// comes back. A receive error is logged and followed by the
    /// configured fixed delay rather than propagated — a transient SQS
    /// hiccup must not crash the agent.
    pub async fn run(&self) {
        if !self.config.polling.enabled {
            info!("polling is disabled");
            return;
        }
        if self.config.sqs.queue_url.is_empty() {
            error!("SQS queue url is not configured");
            return;
        }

        info!(queue_url = %self.config.sqs.queue_url, "starting task dispatcher");
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            match self
                .queue
                .receive(self.config.sqs.max_number_of_messages, self.config.sqs.wait_time_seconds)
                .await
            {
                Ok(messages) => {
                    if messages.is_empty() {
                        continue;
                    }
                    info!(count = messages.len(), "received messages");
                    for message in messages {
                        self.process(message).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "polling error, agent continues");
                    tokio::time::sleep(self.config.polling.fixed_delay()).await;
                }
            }
        }
    }

    /// Run one message through parse -> fetch -> execute -> upload ->
    /// publish, then decide whether to ack based on the error class of
    /// whatever failed (spec §7: ack only when retrying could not help).
    pub async fn process(&self, message: QueueMessage) {
        let task: Task = match serde_json::from_str(&message.body) {
            Ok(task) => task,
            Err(err) => {
                error!(error = %err, "[FAIL][JSON_PARSE] message parsing failed");
                self.ack(&message.receipt_handle).await;
                return;
            }
        };

        if task.request_id.is_empty() {
            error!("task message has no requestId");
            self.ack(&message.receipt_handle).await;
            return;
        }

        info!(
            request_id = %task.request_id,
            function_id = %task.function_id,
            runtime = %task.runtime,
            "received task message"
        );

        match self.run_pipeline(&task).await {
            Ok(result) => {
                self.publish_and_finish(&task, result).await;
                self.ack(&message.receipt_handle).await;
                info!(request_id = %task.request_id, "[DONE][OK]");
            }
            Err(err) => {
                let class = classify(&err);
                error!(request_id = %task.request_id, class = class.as_str(), error = %err, "[FAIL] execution error");
                if should_ack(class) {
                    self.ack(&message.receipt_handle).await;
                }
            }
        }
    }

    async fn run_pipeline(&self, task: &Task) -> Result<ExecutionResult, AgentError> {
        let Some(kind) = RuntimeKind::parse(&task.runtime) else {
            return Err(AgentError::RuntimeUnsupported(task.runtime.clone()));
        };

        let work_dir = self.fetcher.prepare_working_directory(task).await?;
        info!(request_id = %task.request_id, work_dir = %work_dir.display(), "prepared working directory");

        let result = self.executor.run_task(task, kind, &work_dir).await;
        Ok(result)
    }

    async fn publish_and_finish(&self, task: &Task, result: ExecutionResult) {
        info!(
            request_id = %task.request_id,
            exit_code = result.exit_code,
            duration_millis = result.duration_millis,
            success = result.success,
            "execution result"
        );

        let runtime_dimension = RuntimeKind::parse(&task.runtime).map(|k| k.as_str()).unwrap_or(&task.runtime);
        publish_peak_memory(&self.metrics, &task.function_id, runtime_dimension, result.peak_memory_bytes).await;

        self.publisher.publish_result(&result).await;
    }

    async fn ack(&self, receipt_handle: &str) {
        if let Err(err) = self.queue.ack(receipt_handle).await {
            warn!(error = %err, "failed to delete message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::error::{ContainerRuntimeError, FetchError};
    use crate::fetcher::ObjectStore;
    use crate::pool::{fakes::FakeContainerRuntime, WarmPoolManager};
    use crate::publisher::NotificationBus;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FakeObjectStore {
        objects: Arc<Mutex<std::collections::HashMap<(String, String), Vec<u8>>>>,
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .map(Bytes::from)
                .ok_or_else(|| FetchError::ObjectStore(format!("NoSuchKey: {bucket}/{key}")))
        }
        async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), FetchError> {
            self.objects.lock().unwrap().insert((bucket.to_string(), key.to_string()), body);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBus {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationBus for FakeBus {
        async fn publish(&self, _channel: &str, payload: &str) -> Result<u64, crate::error::BusError> {
            self.published.lock().unwrap().push(payload.to_string());
            Ok(1)
        }
        async fn set_with_ttl(&self, _key: &str, _payload: &str, _ttl: u64) -> Result<(), crate::error::BusError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMetrics;

    #[async_trait]
    impl MetricsSink for FakeMetrics {
        async fn put_peak_memory_bytes(&self, _f: &str, _r: &str, _b: f64) -> Result<(), crate::error::MetricsError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        acked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn receive(&self, _max: u32, _wait: u32) -> Result<Vec<QueueMessage>, QueueError> {
            Ok(Vec::new())
        }
        async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
            self.acked.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    fn build_dispatcher(
        dir: &std::path::Path,
    ) -> TaskDispatcher<FakeQueue, FakeObjectStore, FakeBus, FakeMetrics> {
        let mut config = AgentConfig::default();
        config.task_base_dir = dir.display().to_string();
        config.output.enabled = false;
        config.s3.code_bucket = "bucket".into();

        let store = FakeObjectStore::default();
        store.objects.lock().unwrap().insert(
            ("bucket".to_string(), "f1/v1.zip".to_string()),
            zip_bytes(&[("main.py", b"pass")]),
        );

        let fetcher = CodeFetcher::new(store.clone(), dir, "bucket");
        let runtime = Arc::new(FakeContainerRuntime::default());
        let pool = Arc::new(WarmPoolManager::new(runtime, &config));
        let executor = ContainerExecutor::new(pool, store, false, "", "outputs");
        let publisher = ResultPublisher::new(FakeBus::default(), "result:");

        TaskDispatcher::new(FakeQueue::default(), fetcher, executor, publisher, FakeMetrics, config)
    }

    fn task_message(body: &str) -> QueueMessage {
        QueueMessage { body: body.to_string(), receipt_handle: "r1-handle".to_string() }
    }

    #[tokio::test]
    async fn malformed_json_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path());
        dispatcher.process(task_message("{not json")).await;
        assert_eq!(dispatcher.queue.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsupported_runtime_is_not_acked() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path());
        let body = serde_json::json!({
            "requestId": "r1", "functionId": "f1", "runtime": "ruby",
            "s3Bucket": "bucket", "s3Key": "f1/v1.zip"
        })
        .to_string();
        dispatcher.process(task_message(&body)).await;
        assert!(dispatcher.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_run_is_acked_and_published() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path());
        let body = serde_json::json!({
            "requestId": "r1", "functionId": "f1", "runtime": "python",
            "s3Bucket": "bucket", "s3Key": "f1/v1.zip"
        })
        .to_string();
        dispatcher.process(task_message(&body)).await;
        assert_eq!(dispatcher.queue.acked.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.publisher.bus.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn s3_not_found_is_not_acked() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path());
        let body = serde_json::json!({
            "requestId": "r1", "functionId": "f1", "runtime": "python",
            "s3Bucket": "bucket", "s3Key": "missing.zip"
        })
        .to_string();
        dispatcher.process(task_message(&body)).await;
        assert!(dispatcher.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_request_id_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(dir.path());
        let body = serde_json::json!({
            "requestId": "", "functionId": "f1", "runtime": "python",
            "s3Bucket": "bucket", "s3Key": "f1/v1.zip"
        })
        .to_string();
        dispatcher.process(task_message(&body)).await;
        assert_eq!(dispatcher.queue.acked.lock().unwrap().len(), 1);
    }
}
