use anyhow::Context;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pipesync_observability::init();

    let config = pipesync_worker::WorkerConfig::from_env().context("invalid configuration")?;
    tracing::info!(config = ?config, "configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = pipesync_worker::run(config, shutdown_rx);
    tokio::pin!(worker);

    tokio::select! {
        result = &mut worker => return result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested, finishing the current cycle");
            let _ = shutdown_tx.send(true);
        }
    }

    worker.await
}
