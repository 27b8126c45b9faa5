//! Transfer binary.
//!
//! Resolves the configuration, installs logging and metrics, then copies one BigQuery table into
//! Snowflake and exits with a non-zero status unless the transfer succeeded.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use ::config::environment::Environment;
use telemetry::metrics::init_metrics;
use telemetry::tracing::{LogFormat, init_tracing};
use tracing::error;

use crate::config::{Overrides, load_transfer_config};
use crate::core::start_transfer_with_config;

mod config;
mod core;

/// Copies a BigQuery table into a Snowflake table through a stage.
#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(about = "Copies a BigQuery table into Snowflake")]
struct Args {
    /// Directory holding `base` and environment configuration files
    #[arg(long, default_value = ::config::load::CONFIGURATION_DIR)]
    config_dir: PathBuf,

    /// BigQuery project, overrides `source.project_id`
    #[arg(long)]
    project: Option<String>,

    /// BigQuery dataset, overrides `source.dataset_id`
    #[arg(long)]
    dataset: Option<String>,

    /// BigQuery table, overrides `source.table_id`
    #[arg(long)]
    table: Option<String>,

    /// Snowflake stage, overrides `stage`
    #[arg(long)]
    stage: Option<String>,

    /// Path of a service account key file, overrides `source.service_account_key`
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    service_account_key_path: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let environment = Environment::load()?;

    let format = if environment.is_prod() {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"), format)?;

    let overrides = Overrides {
        project: args.project,
        dataset: args.dataset,
        table: args.table,
        stage: args.stage,
        service_account_key_path: args.service_account_key_path,
    };
    let transfer_config = load_transfer_config(&args.config_dir, environment, overrides)?;

    if let Some(listen_addr) = args.metrics_addr {
        init_metrics(
            listen_addr,
            &[("source_table", transfer_config.source.to_string())],
        )?;
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_transfer_with_config(transfer_config));

    if let Err(err) = &result {
        error!("{err:#}");
    }

    result
}
