//! Container execution pipeline (spec §4.G), grounded on
//! `examples/original_source/src/nanogrid_agent/docker_service.py`'s
//! `DockerService.run_task`.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use nanogrid_agent_types::{ExecutionResult, RuntimeKind, Task};
use tracing::{info, warn};

use crate::error::ContainerRuntimeError;
use crate::fetcher::ObjectStore;
use crate::pool::{ContainerRuntime, WarmPoolManager};
use crate::uploader::OutputUploader;

/// Demultiplexes Docker's multiplexed stdout/stderr stream: each frame is an
/// 8-byte header `[stream(1), 0, 0, 0, size(4 big-endian)]` followed by
/// `size` bytes of payload. `feed` may be called with arbitrarily-sized
/// chunks, including ones that split a header or a payload across calls —
/// partial data is buffered until a full frame is available.
#[derive(Default)]
pub struct Demuxer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    pending: Vec<u8>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        loop {
            if self.pending.len() < 8 {
                break;
            }
            let stream_type = self.pending[0];
            let size = u32::from_be_bytes([self.pending[4], self.pending[5], self.pending[6], self.pending[7]]) as usize;
            if self.pending.len() < 8 + size {
                break;
            }
            let payload = &self.pending[8..8 + size];
            match stream_type {
                1 => self.stdout.extend_from_slice(payload),
                2 => self.stderr.extend_from_slice(payload),
                _ => {}
            }
            self.pending.drain(0..8 + size);
        }
    }

    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// Run `cmd` against a live Docker daemon via `bollard`, piping `stdin` if
/// given and demultiplexing the attached socket with [`Demuxer`]. Returns
/// `(exit_code, stdout, stderr)`.
pub async fn exec_with_demux(
    docker: &bollard::Docker,
    container_id: &str,
    work_dir: &str,
    cmd: &[&str],
    stdin: Option<&[u8]>,
) -> Result<(i64, Vec<u8>, Vec<u8>), ContainerRuntimeError> {
    use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                working_dir: Some(work_dir.to_string()),
                attach_stdin: Some(stdin.is_some()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;

    let started = docker
        .start_exec(&exec.id, None::<StartExecOptions>)
        .await
        .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;

    let mut demuxer = Demuxer::new();

    match started {
        StartExecResults::Attached { mut output, mut input } => {
            if let Some(data) = stdin {
                input.write_all(data).await.map_err(|e| ContainerRuntimeError::Io(e))?;
                input.shutdown().await.map_err(|e| ContainerRuntimeError::Io(e))?;
            }
            while let Some(frame) = output.next().await {
                let frame = frame.map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;
                match frame {
                    bollard::container::LogOutput::StdOut { message } => demuxer.feed(&prefix_stdout(&message)),
                    bollard::container::LogOutput::StdErr { message } => demuxer.feed(&prefix_stderr(&message)),
                    _ => {}
                }
            }
        }
        StartExecResults::Detached => {}
    }

    let (stdout, stderr) = demuxer.finish();

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;
    let exit_code = inspect.exit_code.unwrap_or(-1);

    Ok((exit_code, stdout, stderr))
}

fn prefix_stdout(message: &Bytes) -> Vec<u8> {
    frame(1, message)
}

fn prefix_stderr(message: &Bytes) -> Vec<u8> {
    frame(2, message)
}

fn frame(stream_type: u8, message: &Bytes) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + message.len());
    buf.push(stream_type);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);
    buf
}

fn command_for(kind: RuntimeKind) -> &'static [&'static str] {
    match kind {
        RuntimeKind::Python => &["python", "main.py"],
        RuntimeKind::Cpp => &["/bin/bash", "run.sh"],
        RuntimeKind::NodeJs => &["node", "index.js"],
        RuntimeKind::Go => &["/bin/bash", "run.sh"],
    }
}

const DEFAULT_MEMORY_MB: u64 = 128;

/// Build a memory-sizing tip from peak usage vs. the task's allocated
/// memory, matching `docker_service.py`'s four ratio bands. `memory_mb`
/// defaults to 128 when unset, same as the original's `task.memory_mb or 128`.
pub fn optimization_tip(peak_memory_bytes: Option<u64>, memory_mb: Option<u32>) -> Option<String> {
    let peak_bytes = peak_memory_bytes?;
    let allocated_mb = memory_mb.map(u64::from).unwrap_or(DEFAULT_MEMORY_MB).max(1);
    let allocated_bytes = allocated_mb * 1024 * 1024;
    let ratio = peak_bytes as f64 / allocated_bytes as f64;
    let peak_mb = peak_bytes / (1024 * 1024);

    let tip = if ratio < 0.3 {
        let recommended_mb = ((peak_mb as f64 * 1.5).ceil() as u64).max(1);
        let savings = (1.0 - recommended_mb as f64 / allocated_mb as f64) * 100.0;
        format!(
            "Tip: usage ({peak_mb}MB) is far below the configured memory ({allocated_mb}MB). \
             Lowering it to about {recommended_mb}MB could cut cost by roughly {savings:.0}%."
        )
    } else if ratio < 0.7 {
        let recommended_mb = ((peak_mb as f64 * 1.3).ceil() as u64).max(1);
        format!(
            "Tip: configured memory ({allocated_mb}MB) has comfortable headroom over usage ({peak_mb}MB). \
             {recommended_mb}MB would still be safe."
        )
    } else if ratio <= 1.0 {
        format!("Tip: configured memory ({allocated_mb}MB) fits peak usage ({peak_mb}MB) well.")
    } else {
        let recommended_mb = (peak_mb as f64 * 1.2).ceil() as u64;
        format!(
            "Tip: peak usage ({peak_mb}MB) exceeded the configured memory ({allocated_mb}MB). \
             Raise it to at least {recommended_mb}MB for stability."
        )
    };
    Some(tip)
}

/// Builds a tar archive of `host_dir`'s contents, rooted so extracting it
/// reproduces `host_dir`'s own files (not a wrapping directory), for the
/// archive-stream copy into a container's working directory.
fn build_workspace_archive(host_dir: &Path) -> std::io::Result<Bytes> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        builder.append_dir_all(".", host_dir)?;
        builder.finish()?;
    }
    Ok(Bytes::from(buf))
}

/// Executes a task inside a warm-pooled container end to end: acquire,
/// reconcile the working directory, run the command with `task.input`
/// piped on stdin, measure memory, build the tip, upload any output files,
/// and release the container — on every exit path, success or failure.
pub struct ContainerExecutor<S: ObjectStore> {
    pool: Arc<WarmPoolManager>,
    uploader: OutputUploader<S>,
}

impl<S: ObjectStore> ContainerExecutor<S> {
    pub fn new(
        pool: Arc<WarmPoolManager>,
        output_store: S,
        output_enabled: bool,
        user_data_bucket: impl Into<String>,
        output_s3_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            uploader: OutputUploader::new(output_store, output_enabled, user_data_bucket, output_s3_prefix),
        }
    }

    /// `kind` is resolved by the caller (the dispatcher already rejects an
    /// unsupported runtime before a container is ever acquired), so this
    /// never has to re-derive or re-validate it.
    pub async fn run_task(&self, task: &Task, kind: RuntimeKind, work_dir: &Path) -> ExecutionResult {
        let start = Instant::now();
        info!(request_id = %task.request_id, runtime = %kind, "starting execution");

        let container_id = match self.pool.acquire(kind).await {
            Ok(id) => id,
            Err(err) => {
                return ExecutionResult::pipeline_failure(
                    &task.request_id,
                    &task.function_id,
                    format!("failed to acquire container: {err}"),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let container_work_dir = format!("{}/{}", self.pool.docker_config().work_dir_root, task.request_id);
        let result = self.execute(task, kind, &container_id, work_dir, &container_work_dir, start).await;

        self.pool.release(kind, &container_id).await;
        result
    }

    /// Probe for `container_work_dir` inside the container; if absent,
    /// create it and copy `host_work_dir`'s contents in via an
    /// archive-stream upload. Bind-mount propagation for directories
    /// created after the container started can't be relied on, so this
    /// confirms the mount actually surfaced and repairs it if not.
    async fn reconcile_workspace(
        &self,
        container_id: &str,
        host_work_dir: &Path,
        container_work_dir: &str,
    ) -> Result<(), ContainerRuntimeError> {
        let runtime = self.pool.runtime();
        let (probe_exit, _, _) =
            runtime.exec(container_id, "/", &["test", "-d", container_work_dir], None).await?;
        if probe_exit == 0 {
            return Ok(());
        }

        warn!(container_work_dir, "work directory not found in container, creating");
        let (mkdir_exit, _, mkdir_stderr) =
            runtime.exec(container_id, "/", &["mkdir", "-p", container_work_dir], None).await?;
        if mkdir_exit != 0 {
            return Err(ContainerRuntimeError::Docker(format!(
                "failed to create work directory {container_work_dir}: {}",
                String::from_utf8_lossy(&mkdir_stderr)
            )));
        }

        let archive = build_workspace_archive(host_work_dir)?;
        runtime.put_archive(container_id, container_work_dir, archive).await
    }

    async fn execute(
        &self,
        task: &Task,
        kind: RuntimeKind,
        container_id: &str,
        host_work_dir: &Path,
        container_work_dir: &str,
        start: Instant,
    ) -> ExecutionResult {
        if let Err(err) = self.reconcile_workspace(container_id, host_work_dir, container_work_dir).await {
            return ExecutionResult::pipeline_failure(
                &task.request_id,
                &task.function_id,
                format!("failed to reconcile workspace: {err}"),
                start.elapsed().as_millis() as u64,
            );
        }

        let cmd = command_for(kind);
        let stdin = task.input.as_ref().map(|v| serde_json::to_vec(v).unwrap_or_default());

        let exec_result =
            self.pool.runtime().exec(container_id, container_work_dir, cmd, stdin.as_deref()).await;

        let duration_millis = start.elapsed().as_millis() as u64;
        if duration_millis > task.timeout_ms {
            warn!(request_id = %task.request_id, duration_millis, timeout_ms = task.timeout_ms, "execution exceeded advisory timeout");
        }

        let (exit_code, stdout, stderr) = match exec_result {
            Ok(triple) => triple,
            Err(err) => {
                return ExecutionResult::pipeline_failure(
                    &task.request_id,
                    &task.function_id,
                    format!("execution failed: {err}"),
                    duration_millis,
                );
            }
        };

        let peak_memory_bytes = match self.pool.runtime().memory_usage_bytes(container_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to measure memory");
                None
            }
        };

        let mut result = ExecutionResult::new(
            &task.request_id,
            &task.function_id,
            exit_code as i32,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            duration_millis,
        );
        result.peak_memory_bytes = peak_memory_bytes;
        result.optimization_tip = optimization_tip(peak_memory_bytes, task.memory_mb);

        if exit_code == 0 {
            result.output_files = self
                .uploader
                .upload_output_files(
                    self.pool.runtime().as_ref(),
                    &task.request_id,
                    container_id,
                    container_work_dir,
                )
                .await;
        }

        info!(
            request_id = %task.request_id,
            exit_code,
            duration_millis,
            peak_memory_bytes,
            "execution finished"
        );

        result
    }
}
