use clap::{Parser, Subcommand};
use config_store::types::UNKNOWN_USER;
use config_store::{ConfigStore, RequestContext};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod config;

use commands::{Command, CommandError};
use config::{Config, ConfigError};

const STATSD_PREFIX: &str = "configd";

#[derive(Parser)]
#[command(version, about = "Versioned multi-tenant config store")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short)]
    config: PathBuf,

    /// Recorded as the author of writes
    #[arg(long)]
    user_id: Option<String>,

    #[arg(long, requires = "user_id")]
    user_email: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Load and validate the config file, then exit
    CheckConfig,
    #[command(flatten)]
    Store(Command),
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start runtime: {0}")]
    Runtime(std::io::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Store(#[from] config_store::StoreError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

fn init_logging(sentry_enabled: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry_enabled.then(|| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .init();
}

fn init_metrics(config: &Config) -> Result<(), CliError> {
    let Some(metrics) = &config.common.metrics else {
        return Ok(());
    };

    let recorder = metrics_exporter_statsd::StatsdBuilder::from(
        metrics.statsd_host.as_str(),
        metrics.statsd_port,
    )
    .build(Some(STATSD_PREFIX))
    .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(config_store::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    let sentry_guard = config.sentry_dsn().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_logging(sentry_guard.is_some());
    init_metrics(&config)?;

    let command = match cli.command {
        CliCommand::CheckConfig => {
            println!("config ok");
            return Ok(());
        }
        CliCommand::Store(command) => command,
    };

    let ctx = match cli.user_id {
        Some(user_id) => RequestContext::new().with_user(
            user_id,
            cli.user_email.unwrap_or_else(|| UNKNOWN_USER.to_string()),
        ),
        None => RequestContext::new(),
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    rt.block_on(async {
        let store = ConfigStore::from_config(&config.store)?;
        let mut stdout = std::io::stdout().lock();
        commands::execute(&store, &ctx, command, &mut stdout).await?;
        Ok::<(), CliError>(())
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
