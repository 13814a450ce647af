use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mongod_proxy::{Config, LogNotifier, Proxy};

/// Supervises a local `mongod` and exposes it through cached per-database
/// connections, identifier coercion, and registered query cursors.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    /// Root directory for database files and the server log.
    #[arg(long, env = "MONGOD_PROXY_DATA_DIR", default_value = "mongod-proxy-data")]
    data_dir: PathBuf,
    /// Address the supervised server binds.
    #[arg(long, env = "MONGOD_PROXY_BIND_IP", default_value = "127.0.0.1")]
    bind_ip: String,
    /// Port the supervised server listens on.
    #[arg(long, env = "MONGOD_PROXY_PORT", default_value_t = 27017)]
    port: u16,
    /// Logical database used when an operation names none.
    #[arg(long, env = "MONGOD_PROXY_DEFAULT_DB", default_value = "main")]
    default_db: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let result = runtime.block_on(run(args));
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config {
        data_dir: args.data_dir,
        bind_ip: args.bind_ip,
        port: args.port,
        default_db: args.default_db,
    };

    let (proxy, mut cursor_events) = Proxy::load(config, Arc::new(LogNotifier)).await?;
    tracing::info!("mongod-proxy is running");

    tokio::spawn(async move {
        while let Some(event) = cursor_events.recv().await {
            tracing::debug!(?event, "cursor event");
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
    tracing::info!("caught signal to exit");

    proxy.unload().await;
    Ok(())
}
