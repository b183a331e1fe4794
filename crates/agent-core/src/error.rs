//! Shared error types and the error-class -> ack-policy mapping (spec §4.I, §7).

use thiserror::Error;

/// Failure fetching and extracting a code bundle (component C).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("object store error: {0}")]
    ObjectStore(String),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to the container runtime (component F/G).
#[derive(Debug, Error)]
pub enum ContainerRuntimeError {
    #[error("docker error: {0}")]
    Docker(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to the notification bus (component D).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure talking to the metrics sink (component E).
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("cloudwatch error: {0}")]
    CloudWatch(String),
}

/// Failure talking to the task queue (component I).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqs error: {0}")]
    Sqs(String),
}

/// Failure loading configuration (component B).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The unified error type flowing out of a single task's pipeline run
/// (component C through H), used by the dispatcher to pick an ack policy.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("malformed message body: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported runtime: {0}")]
    RuntimeUnsupported(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Container(#[from] ContainerRuntimeError),
    #[error("{0}")]
    Unknown(String),
}

/// The error-class taxonomy from spec §4.I, used only to decide ack policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    JsonParse,
    RuntimeNotSupported,
    S3,
    Docker,
    Unknown,
}

impl ErrorClass {
    /// Wire name used in log lines (`[FAIL][<CLASS>]` in the original implementation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonParse => "JSON_PARSE",
            Self::RuntimeNotSupported => "RUNTIME_NOT_SUPPORTED",
            Self::S3 => "S3",
            Self::Docker => "DOCKER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Classify an error to decide the ack policy. A `Fetch` error is further
/// split into `S3` vs `Unknown` by sniffing the "NoSuchKey" / "Not Found"
/// markers the original implementation keyed off (`ClientError` message
/// text from boto3), since the AWS SDK surfaces them as message substrings
/// rather than a distinguishable error variant for every failure mode.
pub fn classify(err: &AgentError) -> ErrorClass {
    match err {
        AgentError::Parse(_) => ErrorClass::JsonParse,
        AgentError::RuntimeUnsupported(_) => ErrorClass::RuntimeNotSupported,
        AgentError::Container(_) => ErrorClass::Docker,
        AgentError::Fetch(_) => {
            let msg = err.to_string();
            if msg.contains("NoSuchKey") || msg.contains("Not Found") {
                ErrorClass::S3
            } else {
                ErrorClass::Unknown
            }
        }
        AgentError::Unknown(msg) => {
            let lower = msg.to_ascii_lowercase();
            if msg.contains("NoSuchKey") || msg.contains("Not Found") {
                ErrorClass::S3
            } else if lower.contains("docker") || lower.contains("container") {
                ErrorClass::Docker
            } else {
                ErrorClass::Unknown
            }
        }
    }
}

/// Whether the dispatcher should delete (ack) the queue message for this
/// error class. Message ack is governed exclusively by whether retry could
/// plausibly help (spec §7) — never by how "bad" the error looks.
pub fn should_ack(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::JsonParse)
}
