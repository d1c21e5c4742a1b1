use std::{path::PathBuf, process::ExitCode};

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use tracing::error;

use auditdbx::{
    config::{self, Config},
    error::AuditError,
    logging, server,
};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;

#[derive(Parser)]
#[command(author, version, about = "Audit event query API server")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.auditdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve(ServeArgs),
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Override the configured server port
    #[arg(long)]
    port: Option<u16>,

    /// Override the enrichment switch
    #[arg(long)]
    enrich: Option<bool>,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => show_config(&config),
        },
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> ExitCode {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(enrich) = args.enrich {
        config.service.enrich_identity_events = enrich;
    }

    if let Err(err) = config.validate_for_serve() {
        error!("configuration error: {err}");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ AuditError::Config(_)) => {
            error!("configuration error: {err}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(err) => {
            error!("server failed: {err}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn show_config(config: &Config) -> ExitCode {
    match toml::to_string_pretty(config).map_err(|err| anyhow!(err)) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("cannot render configuration: {err}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
