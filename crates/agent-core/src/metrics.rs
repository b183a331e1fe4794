//! Peak-memory metrics publication (spec §4.E), grounded on
//! `examples/original_source/src/nanogrid_agent/cloudwatch_publisher.py`.

use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use aws_sdk_cloudwatch::Client as CloudWatchClient;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::MetricsError;

const NAMESPACE: &str = "NanoGrid/FunctionRunner";
const METRIC_NAME_PEAK_MEMORY: &str = "PeakMemoryBytes";

/// A sink for per-task metrics, abstracted so tests never talk to a real
/// CloudWatch account.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put_peak_memory_bytes(
        &self,
        function_id: &str,
        runtime: &str,
        bytes: f64,
    ) -> Result<(), MetricsError>;
}

pub struct CloudWatchMetricsSink {
    client: CloudWatchClient,
}

impl CloudWatchMetricsSink {
    pub fn new(client: CloudWatchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsSink for CloudWatchMetricsSink {
    async fn put_peak_memory_bytes(
        &self,
        function_id: &str,
        runtime: &str,
        bytes: f64,
    ) -> Result<(), MetricsError> {
        let datum = MetricDatum::builder()
            .metric_name(METRIC_NAME_PEAK_MEMORY)
            .dimensions(Dimension::builder().name("FunctionId").value(function_id).build())
            .dimensions(Dimension::builder().name("Runtime").value(runtime).build())
            .timestamp(aws_sdk_cloudwatch::primitives::DateTime::from_millis(Utc::now().timestamp_millis()))
            .value(bytes)
            .unit(StandardUnit::Bytes)
            .build();

        self.client
            .put_metric_data()
            .namespace(NAMESPACE)
            .metric_data(datum)
            .send()
            .await
            .map_err(|e| MetricsError::CloudWatch(e.into_service_error().to_string()))?;

        Ok(())
    }
}

/// Publish a task's peak memory usage, if one was measured. A publish
/// failure never propagates — a lost metric must not turn a successful
/// task into a failed one.
pub async fn publish_peak_memory(
    sink: &dyn MetricsSink,
    function_id: &str,
    runtime: &str,
    peak_memory_bytes: Option<u64>,
) {
    let Some(bytes) = peak_memory_bytes else {
        debug!(function_id, runtime, "peak memory is unset, skipping metrics publish");
        return;
    };

    info!(function_id, runtime, bytes, "publishing peak memory metric");
    if let Err(err) = sink.put_peak_memory_bytes(function_id, runtime, bytes as f64).await {
        warn!(function_id, runtime, error = %err, "failed to publish metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryMetricsSink {
        recorded: Mutex<Vec<(String, String, f64)>>,
    }

    #[async_trait]
    impl MetricsSink for InMemoryMetricsSink {
        async fn put_peak_memory_bytes(
            &self,
            function_id: &str,
            runtime: &str,
            bytes: f64,
        ) -> Result<(), MetricsError> {
            self.recorded.lock().unwrap().push((function_id.to_string(), runtime.to_string(), bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_when_peak_memory_is_measured() {
        let sink = InMemoryMetricsSink::default();
        publish_peak_memory(&sink, "f1", "python", Some(1_048_576)).await;
        let recorded = sink.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], ("f1".to_string(), "python".to_string(), 1_048_576.0));
    }

    #[tokio::test]
    async fn skips_publish_when_peak_memory_is_unmeasured() {
        let sink = InMemoryMetricsSink::default();
        publish_peak_memory(&sink, "f1", "python", None).await;
        assert!(sink.recorded.lock().unwrap().is_empty());
    }
}
