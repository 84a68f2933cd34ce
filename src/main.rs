//! CLI entry point: parse args, build the resolved config, init tracing,
//! wire the cluster adapter (if configured), and run the server until
//! shutdown (spec §6, §A.3).
//!
//! Grounded in the teacher's `main.rs` (`Cli::parse` -> config resolution ->
//! `tracing_subscriber` init -> `ipc::run` -> `make_shutdown_future`).

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ocpp_rt::cluster::{ClusterAdapter, ClusterDriver, RedisClusterDriver};
use ocpp_rt::config::{Cli, ServerConfig};
use ocpp_rt::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(cli);

    let _log_guard = setup_logging(&config.log, config.log_file.as_deref());

    tracing::info!(
        node_id = %config.node_id,
        port = config.port,
        security_profile = config.security_profile,
        "starting ocpp-rt"
    );

    let schema_set = ocpp_rt::validator::shared_schema_set("ocpp1.6");

    let cluster = match &config.redis_url {
        Some(url) => {
            let driver = RedisClusterDriver::connect(url).await?;
            let driver: Arc<dyn ClusterDriver> = Arc::new(driver);
            Some(ClusterAdapter::new(
                driver,
                config.node_id.clone(),
                config.channel_prefix.clone(),
                config.ping_interval_ms,
                config.stream_maxlen,
            ))
        }
        None => None,
    };

    let server = Server::new(config, Some(schema_set), cluster)?;
    server.run().await?;

    tracing::info!("ocpp-rt shut down cleanly");
    Ok(())
}

/// Initialize the tracing subscriber. If `log_file` is set, JSON logs go to
/// both stdout and a daily-rolling file; the returned guard must stay alive
/// for the process lifetime to flush the file writer.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = || EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .json()
            .init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("ocpp-rt.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(true)
            .json()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().json().with_target(true))
        .with(tracing_subscriber::fmt::layer().json().with_target(true).with_writer(non_blocking))
        .init();

    Some(guard)
}
