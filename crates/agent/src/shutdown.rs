//! SIGINT and SIGTERM both request one graceful stop of the dispatcher.

use std::sync::Arc;

use nanogrid_agent_core::{MetricsSink, NotificationBus, ObjectStore, Queue, TaskDispatcher};
use tracing::info;

/// Spawns a task that waits for SIGINT or SIGTERM and calls
/// `dispatcher.stop()` exactly once.
pub fn spawn_signal_handler<Q, S, B, M>(dispatcher: Arc<TaskDispatcher<Q, S, B, M>>)
where
    Q: Queue + Send + Sync + 'static,
    S: ObjectStore + Send + Sync + 'static,
    B: NotificationBus + Send + Sync + 'static,
    M: MetricsSink + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
        dispatcher.stop();
    });
}
