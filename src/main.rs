use std::time::Duration;

use clap::Parser;
use nftables_exporter::cli::Cli;
use nftables_exporter::exporter::Exporter;
use nftables_exporter::tracing_setup::{get_subscriber, init_subscriber};
use nftables_exporter::{App, Config};
use tokio::sync::watch;
use tracing::info;

async fn shutdown_signal(handle: axum_server::Handle, shutdown: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down");
    let _ = shutdown.send(true);
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Cli::parse();

    let subscriber = get_subscriber(String::from("nftables-exporter"), args.log_level.clone());
    init_subscriber(subscriber)?;

    let config = Config::from(args);
    let app = App::new(config);
    let handle = axum_server::Handle::new();
    let exporter = Exporter::new(app.config.listen_addr, handle.clone());
    info!(msg = "Listening", addr = %app.config.listen_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(handle, shutdown_tx));

    let mut task_set = tokio::task::JoinSet::new();
    let refresher = app.refresher;
    let cache = app.cache;
    task_set.spawn(async move { refresher.run(shutdown_rx).await });
    task_set.spawn(async move { Ok(exporter.serve(cache).await?) });

    while let Some(res) = task_set.join_next().await {
        res??;
    }

    info!("Exit!");

    Ok(())
}
