use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// The outcome of running a task's code bundle to completion (or of a
/// pipeline-internal failure before user code ever ran).
///
/// `success` is derived (`exit_code == 0`) and is not itself present on the
/// wire — the wire form carries the equivalent `status` string instead, so
/// round-tripping through JSON reconstructs `success` from `exit_code`
/// rather than trusting a redundant field.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub request_id: String,
    pub function_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_millis: u64,
    pub success: bool,
    pub peak_memory_bytes: Option<u64>,
    pub optimization_tip: Option<String>,
    pub output_files: Vec<String>,
}

/// Reserved exit code for a pipeline-internal failure (never produced by user code).
pub const PIPELINE_FAILURE_EXIT_CODE: i32 = -1;

impl ExecutionResult {
    /// Build a result from a completed exec, deriving `success` from `exit_code`.
    pub fn new(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_millis: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_millis,
            success: exit_code == 0,
            peak_memory_bytes: None,
            optimization_tip: None,
            output_files: Vec::new(),
        }
    }

    /// A pipeline-internal failure record (fetch/container error before exec ran).
    pub fn pipeline_failure(
        request_id: impl Into<String>,
        function_id: impl Into<String>,
        message: impl Into<String>,
        duration_millis: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            function_id: function_id.into(),
            exit_code: PIPELINE_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: message.into(),
            duration_millis,
            success: false,
            peak_memory_bytes: None,
            optimization_tip: None,
            output_files: Vec::new(),
        }
    }

    fn status(&self) -> &'static str {
        if self.success { "SUCCESS" } else { "FAILED" }
    }

    /// Peak memory floor-divided into MiB, for the `peakMemoryMB` wire field.
    fn peak_memory_mb(&self) -> Option<u64> {
        self.peak_memory_bytes.map(|b| b >> 20)
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let field_count = 7
            + usize::from(self.peak_memory_bytes.is_some()) * 2
            + usize::from(self.optimization_tip.is_some())
            + usize::from(!self.output_files.is_empty());
        let mut s = serializer.serialize_struct("ExecutionResult", field_count)?;
        s.serialize_field("requestId", &self.request_id)?;
        s.serialize_field("functionId", &self.function_id)?;
        s.serialize_field("status", self.status())?;
        s.serialize_field("exitCode", &self.exit_code)?;
        s.serialize_field("durationMillis", &self.duration_millis)?;
        s.serialize_field("stdout", &self.stdout)?;
        s.serialize_field("stderr", &self.stderr)?;
        if let Some(bytes) = self.peak_memory_bytes {
            s.serialize_field("peakMemoryBytes", &bytes)?;
            s.serialize_field("peakMemoryMB", &self.peak_memory_mb().unwrap())?;
        }
        if let Some(tip) = &self.optimization_tip {
            s.serialize_field("optimizationTip", tip)?;
        }
        if !self.output_files.is_empty() {
            s.serialize_field("outputFiles", &self.output_files)?;
        }
        s.end()
    }
}

#[derive(serde::Deserialize)]
struct ExecutionResultWire {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "functionId")]
    function_id: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
    #[serde(rename = "durationMillis")]
    duration_millis: u64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(rename = "peakMemoryBytes", default)]
    peak_memory_bytes: Option<u64>,
    #[serde(rename = "optimizationTip", default)]
    optimization_tip: Option<String>,
    #[serde(rename = "outputFiles", default)]
    output_files: Vec<String>,
}

impl<'de> Deserialize<'de> for ExecutionResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ExecutionResultWire::deserialize(deserializer)?;
        Ok(Self {
            request_id: wire.request_id,
            function_id: wire.function_id,
            exit_code: wire.exit_code,
            stdout: wire.stdout,
            stderr: wire.stderr,
            duration_millis: wire.duration_millis,
            success: wire.exit_code == 0,
            peak_memory_bytes: wire.peak_memory_bytes,
            optimization_tip: wire.optimization_tip,
            output_files: wire.output_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_peak_memory_mb_are_derived_on_serialize() {
        let mut r = ExecutionResult::new("r1", "f1", 0, "6\n", "", 120);
        r.peak_memory_bytes = Some(41_943_040); // 40 MiB
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["peakMemoryBytes"], 41_943_040u64);
        assert_eq!(json["peakMemoryMB"], 40);
    }

    #[test]
    fn peak_memory_fields_absent_when_unmeasured() {
        let r = ExecutionResult::new("r1", "f1", 0, "", "", 10);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("peakMemoryBytes").is_none());
        assert!(json.get("peakMemoryMB").is_none());
    }

    #[test]
    fn failed_status_derived_from_nonzero_exit_code() {
        let r = ExecutionResult::new("r1", "f1", 2, "", "bad", 5);
        assert!(!r.success);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "FAILED");
    }

    #[test]
    fn round_trips_through_json() {
        let mut r = ExecutionResult::new("r1", "f1", 0, "out", "err", 42);
        r.peak_memory_bytes = Some(1_048_576);
        r.optimization_tip = Some("tip".into());
        r.output_files = vec!["s3://bucket/key".into()];
        let json = serde_json::to_string(&r).unwrap();
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn pipeline_failure_has_reserved_exit_code() {
        let r = ExecutionResult::pipeline_failure("r1", "f1", "boom", 3);
        assert_eq!(r.exit_code, PIPELINE_FAILURE_EXIT_CODE);
        assert!(!r.success);
        assert_eq!(r.stderr, "boom");
    }
}
