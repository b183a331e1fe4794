#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Core services backing the NanoGrid compute agent: configuration,
//! code retrieval, container execution, result publication, and the
//! queue-driven dispatcher tying them together.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod metrics;
pub mod publisher;
pub mod pool;
pub mod uploader;

pub use config::AgentConfig;
pub use dispatcher::{Queue, QueueMessage, SqsQueue, TaskDispatcher};
pub use error::{classify, should_ack, AgentError, ErrorClass};
pub use executor::ContainerExecutor;
pub use fetcher::{CodeFetcher, ObjectStore, S3ObjectStore};
pub use metrics::{CloudWatchMetricsSink, MetricsSink};
pub use pool::{BollardContainerRuntime, ContainerRuntime, WarmPoolManager};
pub use publisher::{NotificationBus, RedisNotificationBus, ResultPublisher};
pub use uploader::OutputUploader;
