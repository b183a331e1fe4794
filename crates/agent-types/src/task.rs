use serde::{Deserialize, Serialize};

fn default_timeout_ms() -> u64 {
    10_000
}

/// A unit of work as delivered by the queue.
///
/// `runtime` is kept as the raw string from the wire; resolving it to a
/// [`crate::RuntimeKind`] is deferred to the executor so that an unknown
/// runtime can be distinguished, at the ack-policy level, from a malformed
/// message (see the dispatcher's error classes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "functionId")]
    pub function_id: String,
    pub runtime: String,
    #[serde(rename = "s3Bucket", default)]
    pub s3_bucket: String,
    #[serde(rename = "s3Key", default)]
    pub s3_key: String,
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(rename = "memoryMb", default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_message() {
        let raw = json!({
            "requestId": "r1",
            "functionId": "f1",
            "runtime": "python",
            "s3Bucket": "b",
            "s3Key": "f1/v1.zip",
            "timeoutMs": 5000,
            "memoryMb": 128,
            "input": {"n": 3}
        });
        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.request_id, "r1");
        assert_eq!(task.timeout_ms, 5000);
        assert_eq!(task.memory_mb, Some(128));
        assert_eq!(task.input, Some(json!({"n": 3})));
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let raw = json!({
            "requestId": "r1",
            "functionId": "f1",
            "runtime": "python",
            "s3Bucket": "b",
            "s3Key": "k"
        });
        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.timeout_ms, 10_000);
        assert_eq!(task.memory_mb, None);
        assert_eq!(task.input, None);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let raw = json!({
            "requestId": "r1",
            "functionId": "f1",
            "runtime": "python",
            "s3Bucket": "b",
            "s3Key": "k",
            "somethingFromTheFuture": true
        });
        assert!(serde_json::from_value::<Task>(raw).is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let task = Task {
            request_id: "r1".into(),
            function_id: "f1".into(),
            runtime: "python".into(),
            s3_bucket: "b".into(),
            s3_key: "k".into(),
            timeout_ms: 1234,
            memory_mb: Some(256),
            input: Some(json!({"a": 1})),
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }
}
