//! Layered configuration (spec §4.B), grouped the same way
//! `examples/original_source/src/nanogrid_agent/config.py` groups it.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self { region: "ap-northeast-2".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub queue_url: String,
    pub wait_time_seconds: u32,
    pub max_number_of_messages: u32,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            wait_time_seconds: 20,
            max_number_of_messages: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub code_bucket: String,
    pub user_data_bucket: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub python_image: String,
    pub cpp_image: String,
    pub nodejs_image: String,
    pub go_image: String,
    pub work_dir_root: String,
    pub default_timeout_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            python_image: "python-base".into(),
            cpp_image: "gcc-base".into(),
            nodejs_image: "node-base".into(),
            go_image: "go-base".into(),
            work_dir_root: "/workspace-root".into(),
            default_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub enabled: bool,
    pub python_size: u32,
    pub cpp_size: u32,
    pub nodejs_size: u32,
    pub go_size: u32,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            python_size: 2,
            cpp_size: 1,
            nodejs_size: 1,
            go_size: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub fixed_delay_seconds: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { enabled: true, fixed_delay_seconds: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub result_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: String::new(),
            result_prefix: "result:".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub base_dir: String,
    pub s3_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: "/tmp/output".into(),
            s3_prefix: "outputs".into(),
        }
    }
}

/// The agent's full, nested configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub aws: AwsConfig,
    pub sqs: SqsConfig,
    pub s3: S3Config,
    pub docker: DockerConfig,
    pub warm_pool: WarmPoolConfig,
    pub polling: PollingConfig,
    pub redis: RedisConfig,
    pub output: OutputConfig,
    pub task_base_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            aws: AwsConfig::default(),
            sqs: SqsConfig::default(),
            s3: S3Config::default(),
            docker: DockerConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            polling: PollingConfig::default(),
            redis: RedisConfig::default(),
            output: OutputConfig::default(),
            task_base_dir: "/tmp/task".into(),
        }
    }
}

impl PollingConfig {
    pub fn fixed_delay(&self) -> Duration {
        Duration::from_secs_f64(self.fixed_delay_seconds.max(0.0))
    }
}

/// Environment variable that names an explicit config file path, checked
/// when no `--config` flag was given (mirrors `NANOGRID_CONFIG` in the
/// original Python agent).
pub const CONFIG_PATH_ENV: &str = "NANOGRID_CONFIG";

impl AgentConfig {
    /// Load precedence (spec §4.B): explicit path -> `$NANOGRID_CONFIG` ->
    /// `./config.yaml` -> pure environment. A fixed set of environment
    /// variables (`SQS_QUEUE_URL`, `REDIS_HOST`) then override the loaded
    /// config regardless of which source won, matching the original's
    /// "load from file, then override from env" two-pass behavior.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = explicit_path.filter(|p| p.exists()) {
            Self::from_yaml_file(path)?
        } else if let Some(path) = std::env::var_os(CONFIG_PATH_ENV)
            .map(std::path::PathBuf::from)
            .filter(|p| p.exists())
        {
            Self::from_yaml_file(&path)?
        } else if Path::new("config.yaml").exists() {
            Self::from_yaml_file(Path::new("config.yaml"))?
        } else {
            Self::from_env()?
        };

        if let Ok(queue_url) = std::env::var("SQS_QUEUE_URL") {
            config.sqs.queue_url = queue_url;
        }
        if let Ok(host) = std::env::var("REDIS_HOST") {
            config.redis.host = host;
        }

        Ok(config)
    }

    fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: AgentConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Build a config purely from environment variables, defaults filling
    /// in everything unset. Numeric fields parse from decimal strings;
    /// boolean fields parse case-insensitively from `true`/`false`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_string(&mut config.aws.region, "AWS_REGION");
        env_string(&mut config.sqs.queue_url, "SQS_QUEUE_URL");
        env_u32(&mut config.sqs.wait_time_seconds, "SQS_WAIT_TIME_SECONDS")?;
        env_u32(&mut config.sqs.max_number_of_messages, "SQS_MAX_MESSAGES")?;

        env_string(&mut config.s3.code_bucket, "S3_CODE_BUCKET");
        env_string(&mut config.s3.user_data_bucket, "S3_USER_DATA_BUCKET");

        env_string(&mut config.docker.python_image, "DOCKER_PYTHON_IMAGE");
        env_string(&mut config.docker.cpp_image, "DOCKER_CPP_IMAGE");
        env_string(&mut config.docker.nodejs_image, "DOCKER_NODEJS_IMAGE");
        env_string(&mut config.docker.go_image, "DOCKER_GO_IMAGE");
        env_string(&mut config.docker.work_dir_root, "DOCKER_WORK_DIR_ROOT");
        env_u64(&mut config.docker.default_timeout_ms, "DOCKER_TIMEOUT_MS")?;

        env_bool(&mut config.warm_pool.enabled, "WARM_POOL_ENABLED")?;
        env_u32(&mut config.warm_pool.python_size, "WARM_POOL_PYTHON_SIZE")?;
        env_u32(&mut config.warm_pool.cpp_size, "WARM_POOL_CPP_SIZE")?;
        env_u32(&mut config.warm_pool.nodejs_size, "WARM_POOL_NODEJS_SIZE")?;
        env_u32(&mut config.warm_pool.go_size, "WARM_POOL_GO_SIZE")?;

        env_string(&mut config.redis.host, "REDIS_HOST");
        env_u16(&mut config.redis.port, "REDIS_PORT")?;
        env_string(&mut config.redis.password, "REDIS_PASSWORD");
        env_string(&mut config.redis.result_prefix, "REDIS_RESULT_PREFIX");

        env_bool(&mut config.output.enabled, "OUTPUT_ENABLED")?;
        env_string(&mut config.output.base_dir, "OUTPUT_BASE_DIR");
        env_string(&mut config.output.s3_prefix, "OUTPUT_S3_PREFIX");

        env_string(&mut config.task_base_dir, "TASK_BASE_DIR");

        Ok(config)
    }
}

fn env_string(field: &mut String, key: &'static str) {
    if let Ok(value) = std::env::var(key) {
        *field = value;
    }
}

fn env_bool(field: &mut bool, key: &'static str) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(key) {
        *field = match value.to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(ConfigError::InvalidValue { field: key, value }),
        };
    }
    Ok(())
}

macro_rules! env_parsed {
    ($name:ident, $ty:ty) => {
        fn $name(field: &mut $ty, key: &'static str) -> Result<(), ConfigError> {
            if let Ok(value) = std::env::var(key) {
                *field = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { field: key, value })?;
            }
            Ok(())
        }
    };
}

env_parsed!(env_u16, u16);
env_parsed!(env_u32, u32);
env_parsed!(env_u64, u64);
