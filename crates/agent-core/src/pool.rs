//! Warm container pool (spec §4.F), grounded on
//! `examples/original_source/src/nanogrid_agent/docker_service.py`'s
//! `WarmPoolManager`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nanogrid_agent_types::RuntimeKind;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, DockerConfig, WarmPoolConfig};
use crate::error::ContainerRuntimeError;

/// Abstracts the Docker Engine API surface the agent needs, so the pool and
/// executor can be tested against an in-memory fake instead of a real
/// daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_and_start(
        &self,
        image: &str,
        name: &str,
        binds: &[(String, String)],
        cmd: &[&str],
    ) -> Result<String, ContainerRuntimeError>;

    async fn pause(&self, container_id: &str) -> Result<(), ContainerRuntimeError>;
    async fn unpause(&self, container_id: &str) -> Result<(), ContainerRuntimeError>;
    async fn stop(&self, container_id: &str, timeout_secs: u32) -> Result<(), ContainerRuntimeError>;
    async fn remove(&self, container_id: &str, force: bool) -> Result<(), ContainerRuntimeError>;
    async fn is_running(&self, container_id: &str) -> Result<bool, ContainerRuntimeError>;

    /// Execute `cmd` in `container_id`, optionally piping `stdin`.
    /// Returns `(exit_code, stdout, stderr)`.
    async fn exec(
        &self,
        container_id: &str,
        work_dir: &str,
        cmd: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<(i64, Vec<u8>, Vec<u8>), ContainerRuntimeError>;

    /// Peak (or current) memory usage in bytes, if the runtime can report it.
    async fn memory_usage_bytes(&self, container_id: &str) -> Result<Option<u64>, ContainerRuntimeError>;

    /// Fetch a tar archive of `path` inside the container.
    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Bytes, ContainerRuntimeError>;

    /// Extract a tar archive into `path` inside the container, creating any
    /// entries it contains relative to that path.
    async fn put_archive(&self, container_id: &str, path: &str, archive: Bytes) -> Result<(), ContainerRuntimeError>;
}

/// Docker Engine API backend for [`ContainerRuntime`], wrapping
/// `bollard::Docker`.
pub struct BollardContainerRuntime {
    docker: bollard::Docker,
}

impl BollardContainerRuntime {
    pub fn new(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for BollardContainerRuntime {
    async fn create_and_start(
        &self,
        image: &str,
        name: &str,
        binds: &[(String, String)],
        cmd: &[&str],
    ) -> Result<String, ContainerRuntimeError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let host_config = HostConfig {
            binds: Some(binds.iter().map(|(host, container)| format!("{host}:{container}:rw")).collect()),
            ..Default::default()
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions { name: name.to_string(), platform: None };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;
        Ok(created.id)
    }

    async fn pause(&self, container_id: &str) -> Result<(), ContainerRuntimeError> {
        self.docker
            .pause_container(container_id)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))
    }

    async fn unpause(&self, container_id: &str) -> Result<(), ContainerRuntimeError> {
        self.docker
            .unpause_container(container_id)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))
    }

    async fn stop(&self, container_id: &str, timeout_secs: u32) -> Result<(), ContainerRuntimeError> {
        use bollard::container::StopContainerOptions;
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs as i64 }))
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), ContainerRuntimeError> {
        use bollard::container::RemoveContainerOptions;
        self.docker
            .remove_container(container_id, Some(RemoveContainerOptions { force, ..Default::default() }))
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, ContainerRuntimeError> {
        let info = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn exec(
        &self,
        container_id: &str,
        work_dir: &str,
        cmd: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<(i64, Vec<u8>, Vec<u8>), ContainerRuntimeError> {
        crate::executor::exec_with_demux(&self.docker, container_id, work_dir, cmd, stdin).await
    }

    async fn memory_usage_bytes(&self, container_id: &str) -> Result<Option<u64>, ContainerRuntimeError> {
        use bollard::container::StatsOptions;
        use futures_util::StreamExt;

        let mut stream = self.docker.stats(container_id, Some(StatsOptions { stream: false, one_shot: true }));
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats.memory_stats.usage),
            Some(Err(err)) => Err(ContainerRuntimeError::Docker(err.to_string())),
            None => Ok(None),
        }
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Bytes, ContainerRuntimeError> {
        use bollard::container::DownloadFromContainerOptions;
        use futures_util::StreamExt;

        let options = DownloadFromContainerOptions { path: path.to_string() };
        let mut stream = self.docker.download_from_container(container_id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(|e| ContainerRuntimeError::Docker(e.to_string()))?);
        }
        Ok(Bytes::from(buf))
    }

    async fn put_archive(&self, container_id: &str, path: &str, archive: Bytes) -> Result<(), ContainerRuntimeError> {
        use bollard::container::UploadToContainerOptions;

        let options = UploadToContainerOptions { path: path.to_string(), ..Default::default() };
        self.docker
            .upload_to_container(container_id, Some(options), archive)
            .await
            .map_err(|e| ContainerRuntimeError::Docker(e.to_string()))
    }
}

struct RuntimePool {
    queue: Mutex<VecDeque<String>>,
    image: String,
}

/// Creates, pauses, and recycles per-runtime containers so a task never
/// pays full container startup cost on the hot path.
pub struct WarmPoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    pools: HashMap<RuntimeKind, RuntimePool>,
    docker: DockerConfig,
    work_dir_root: String,
    task_base_dir: String,
    enabled: bool,
}

fn image_for(docker: &DockerConfig, kind: RuntimeKind) -> String {
    match kind {
        RuntimeKind::Python => docker.python_image.clone(),
        RuntimeKind::Cpp => docker.cpp_image.clone(),
        RuntimeKind::NodeJs => docker.nodejs_image.clone(),
        RuntimeKind::Go => docker.go_image.clone(),
    }
}

impl WarmPoolManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AgentConfig) -> Self {
        let mut pools = HashMap::new();
        for kind in [RuntimeKind::Python, RuntimeKind::Cpp, RuntimeKind::NodeJs, RuntimeKind::Go] {
            pools.insert(
                kind,
                RuntimePool { queue: Mutex::new(VecDeque::new()), image: image_for(&config.docker, kind) },
            );
        }
        Self {
            runtime,
            pools,
            docker: config.docker.clone(),
            work_dir_root: config.docker.work_dir_root.clone(),
            task_base_dir: config.task_base_dir.clone(),
            enabled: config.warm_pool.enabled,
        }
    }

    /// Pre-create and pause each runtime's configured pool size. A no-op
    /// when warm pooling is disabled, matching the original's early return.
    pub async fn initialize(&self, sizes: &WarmPoolConfig) -> Result<(), ContainerRuntimeError> {
        if !self.enabled {
            info!("warm pool is disabled");
            return Ok(());
        }

        for (kind, size) in [
            (RuntimeKind::Python, sizes.python_size),
            (RuntimeKind::Cpp, sizes.cpp_size),
            (RuntimeKind::NodeJs, sizes.nodejs_size),
            (RuntimeKind::Go, sizes.go_size),
        ] {
            info!(runtime = %kind, size, "creating warm pool containers");
            for _ in 0..size {
                let container_id = self.create_and_pause(kind).await?;
                let pool = &self.pools[&kind];
                pool.queue.lock().await.push_back(container_id);
            }
        }
        Ok(())
    }

    fn container_name(&self, kind: RuntimeKind) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("nanogrid-warmpool-{kind}-{nanos}")
    }

    async fn create_and_pause(&self, kind: RuntimeKind) -> Result<String, ContainerRuntimeError> {
        let pool = &self.pools[&kind];
        let name = self.container_name(kind);
        let binds = vec![(self.task_base_dir.clone(), self.work_dir_root.clone())];
        let container_id = self
            .runtime
            .create_and_start(&pool.image, &name, &binds, &["sleep", "infinity"])
            .await?;
        self.runtime.pause(&container_id).await?;
        debug!(container_id = %short_id(&container_id), "created and paused warm pool container");
        Ok(container_id)
    }

    /// Check out a container for `kind`, unpausing it. Falls back to a
    /// freshly created container if the pool is empty, and retries once
    /// with a brand new container if the unpause of a pooled one fails.
    pub async fn acquire(&self, kind: RuntimeKind) -> Result<String, ContainerRuntimeError> {
        let pool = &self.pools[&kind];
        let popped = pool.queue.lock().await.pop_front();

        let container_id = match popped {
            Some(id) => id,
            None => {
                warn!(runtime = %kind, "pool empty, creating new container");
                self.create_and_pause(kind).await?
            }
        };

        match self.runtime.unpause(&container_id).await {
            Ok(()) => {
                info!(container_id = %short_id(&container_id), runtime = %kind, "acquired container");
                Ok(container_id)
            }
            Err(err) => {
                warn!(error = %err, "failed to unpause pooled container, discarding and retrying once");
                self.discard(&container_id).await;
                let fresh = self.create_and_pause(kind).await?;
                self.runtime.unpause(&fresh).await?;
                Ok(fresh)
            }
        }
    }

    /// Return a container to its pool, pausing it first. A non-running
    /// container is discarded instead of pooled.
    pub async fn release(&self, kind: RuntimeKind, container_id: &str) {
        match self.runtime.is_running(container_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(container_id = %short_id(container_id), "container not running, discarding");
                self.discard(container_id).await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to inspect container, discarding");
                self.discard(container_id).await;
                return;
            }
        }

        if let Err(err) = self.runtime.pause(container_id).await {
            warn!(error = %err, "failed to pause container, discarding");
            self.discard(container_id).await;
            return;
        }

        let pool = &self.pools[&kind];
        let mut queue = pool.queue.lock().await;
        queue.push_back(container_id.to_string());
        info!(container_id = %short_id(container_id), runtime = %kind, pool_size = queue.len(), "released container");
    }

    /// Stop and remove a container outside any pool, with a short grace
    /// period before the forced removal.
    async fn discard(&self, container_id: &str) {
        if let Err(err) = self.runtime.stop(container_id, 5).await {
            debug!(error = %err, "stop failed during discard, continuing to remove");
        }
        if let Err(err) = self.runtime.remove(container_id, true).await {
            warn!(error = %err, "failed to remove discarded container");
        }
    }

    /// Drain and discard every pooled container, for process shutdown.
    pub async fn shutdown(&self) {
        info!("cleaning up warm pool containers");
        for (kind, pool) in &self.pools {
            let mut queue = pool.queue.lock().await;
            let count = queue.len();
            info!(runtime = %kind, count, "cleaning up pool");
            while let Some(container_id) = queue.pop_front() {
                self.discard(&container_id).await;
            }
        }
    }

    pub fn docker_config(&self) -> &DockerConfig {
        &self.docker
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}
