//! reqmeterd — demo HTTP service instrumented with reqmeter.
//!
//! Serves a handful of routes through the axum middleware, exposes
//! `/metrics`, and optionally writes periodic snapshots to a file.
//!
//! # Usage
//!
//! ```text
//! reqmeterd serve --port 8080 --service-name checkout --metrics-file /tmp/checkout.prom
//! reqmeterd config --config reqmeter.toml
//! ```

mod app;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reqmeter_core::{MetricsConfig, MetricsContext};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "reqmeterd", about = "Request metrics demo daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the instrumented service.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,

        #[command(flatten)]
        overrides: ConfigArgs,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        overrides: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to a reqmeter.toml file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Value of the `service` label.
    #[arg(long)]
    service_name: Option<String>,

    /// Value of the `pod` label (defaults to the host name).
    #[arg(long)]
    instance_id: Option<String>,

    /// Write metric snapshots to this file.
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Snapshot interval in seconds.
    #[arg(long)]
    interval: Option<u64>,
}

impl ConfigArgs {
    /// File, then environment, then command line.
    fn resolve(self) -> anyhow::Result<MetricsConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => MetricsConfig::default(),
        }
        .with_env_overrides();

        if let Some(name) = self.service_name {
            config.service_name = name;
        }
        if let Some(id) = self.instance_id {
            config.instance_id = id;
        }
        if let Some(path) = self.metrics_file {
            config.write_to_file = true;
            config.file_path = Some(path);
        }
        if let Some(secs) = self.interval {
            config.interval_secs = secs;
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> anyhow::Result<MetricsConfig> {
    MetricsConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            log_json,
            overrides,
        } => {
            init_tracing(log_json);
            run_serve(port, overrides.resolve()?).await
        }
        Command::Config { overrides } => {
            let config = overrides.resolve()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqmeter=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_serve(port: u16, config: MetricsConfig) -> anyhow::Result<()> {
    info!("reqmeterd starting");

    let ctx = MetricsContext::global();
    let router = app::build_router(ctx, &config).context("failed to install request metrics")?;
    ctx.start(config.start_options())
        .context("failed to start metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    ctx.stop();
    info!("reqmeterd stopped");
    Ok(())
}
