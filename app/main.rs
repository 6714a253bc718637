use clap::Parser as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter as tracing_filter, layer::SubscriberExt as _,
};

mod app;
mod cli;
mod rpc_server;

use app::App;
use cli::Config;

/// Must outlive the program for file logs to be flushed
type LogGuard = Option<WorkerGuard>;

fn env_filter(directive: &str) -> anyhow::Result<EnvFilter> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_filter::LevelFilter::INFO.into())
        .parse(directive)?
        // jsonrpsee logs every request at debug
        .add_directive("jsonrpsee_server=info".parse()?);
    Ok(filter)
}

fn set_tracing_subscriber(config: &Config) -> anyhow::Result<LogGuard> {
    let stdout_layer = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };
    let (file_layer, guard) = match &config.log_dir {
        None => (None, None),
        Some(log_dir) => {
            let appender =
                tracing_appender::rolling::daily(log_dir, "wagerpool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
    };
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(&config.log_level)?)
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = cli.get_config()?;
    let _log_guard: LogGuard = set_tracing_subscriber(&config)?;
    tracing::info!(
        datadir = %config.node.datadir.display(),
        "starting wagerpool ({})",
        config.custody_summary()
    );
    let app = App::new(&config)?;
    app.spawn_timeline_task(config.timeline_interval);
    let addr = rpc_server::run_server(app.clone(), config.rpc_addr).await?;
    tracing::info!("RPC server listening on {addr}");

    tokio::select! {
        () = app.shutdown.cancelled() => (),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("received interrupt, shutting down");
            app.shutdown.cancel();
        }
    }
    Ok(())
}
