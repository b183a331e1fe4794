mod cli;
mod shutdown;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nanogrid_agent_core::{
    AgentConfig, BollardContainerRuntime, CloudWatchMetricsSink, CodeFetcher, ContainerExecutor,
    RedisNotificationBus, ResultPublisher, S3ObjectStore, SqsQueue, TaskDispatcher, WarmPoolManager,
};

use crate::cli::Cli;
use crate::shutdown::spawn_signal_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "agent exited with a fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    tracing::info!(
        queue_url = %config.sqs.queue_url,
        warm_pool_enabled = config.warm_pool.enabled,
        "starting nanogrid agent"
    );

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws.region.clone()))
        .load()
        .await;

    let s3_client = aws_sdk_s3::Client::new(&aws_config);
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
    let cloudwatch_client = aws_sdk_cloudwatch::Client::new(&aws_config);

    let docker = bollard::Docker::connect_with_local_defaults().context("failed to connect to docker daemon")?;
    let container_runtime = Arc::new(BollardContainerRuntime::new(docker));

    let warm_pool = Arc::new(WarmPoolManager::new(container_runtime, &config));
    warm_pool.initialize(&config.warm_pool).await.context("failed to initialize warm pool")?;

    let fetch_store = S3ObjectStore::new(s3_client.clone());
    let fetcher = CodeFetcher::new(fetch_store, config.task_base_dir.clone(), config.s3.code_bucket.clone());

    let upload_store = S3ObjectStore::new(s3_client);
    let executor = ContainerExecutor::new(
        warm_pool.clone(),
        upload_store,
        config.output.enabled,
        config.s3.user_data_bucket.clone(),
        config.output.s3_prefix.clone(),
    );

    let bus = RedisNotificationBus::connect(&config.redis.host, config.redis.port, &config.redis.password)
        .await
        .context("failed to connect to redis")?;
    let publisher = ResultPublisher::new(bus, config.redis.result_prefix.clone());

    let metrics = CloudWatchMetricsSink::new(cloudwatch_client);

    let queue = SqsQueue::new(sqs_client, config.sqs.queue_url.clone());

    let dispatcher = Arc::new(TaskDispatcher::new(queue, fetcher, executor, publisher, metrics, config));

    spawn_signal_handler(dispatcher.clone());
    dispatcher.run().await;

    warm_pool.shutdown().await;
    tracing::info!("agent shut down cleanly");
    Ok(())
}
