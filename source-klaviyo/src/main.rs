//! CLI entry point: `spec`, `check`, `discover`, `read` (§6).

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use source_base::driver::{DriverConfig, SyncDriver};
use source_base::error::SourceError;
use source_base::state::StateManager;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use source_klaviyo::catalog;
use source_klaviyo::client::KlaviyoClient;
use source_klaviyo::config::Config;
use source_klaviyo::streams;

#[derive(Parser)]
#[command(name = "source-klaviyo", about = "Incremental sync connector for the Klaviyo REST API")]
struct Cli {
    /// Raise the log filter to `debug` regardless of the config file's
    /// `debug` key.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Emit a JSON specification document describing config fields.
    Spec,
    /// Validate the config document and credentials, without syncing.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Emit a JSON catalog of available streams.
    Discover {
        #[arg(long)]
        config: PathBuf,
    },
    /// Stream NDJSON RECORD/STATE/STATUS/LOG messages to stdout.
    Read {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

/// The subset of `discover`'s catalog shape `read` needs: which streams
/// were selected for this run.
#[derive(Deserialize)]
struct ConfiguredCatalog {
    streams: Vec<ConfiguredStream>,
}

#[derive(Deserialize)]
struct ConfiguredStream {
    name: String,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("source_base={default_level},source_klaviyo={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).compact().init();
}

fn emit(message: &source_base::message::Message) {
    if let Ok(line) = message.to_ndjson_line() {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "source-klaviyo terminated with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), SourceError> {
    match cli.command {
        Command::Spec => {
            init_tracing(cli.debug);
            println!("{}", serde_json::to_string_pretty(&spec_document())?);
            Ok(())
        }
        Command::Check { config } => {
            let config = Config::load(&config)?;
            init_tracing(cli.debug || config.debug);
            let result = check(&config).await;
            let status = match &result {
                Ok(()) => json!({"status": "SUCCEEDED"}),
                Err(e) => json!({"status": "FAILED", "message": e.to_string()}),
            };
            println!("{}", serde_json::to_string(&status)?);
            result
        }
        Command::Discover { config } => {
            let config = Config::load(&config)?;
            init_tracing(cli.debug || config.debug);
            let client = KlaviyoClient::new(&config.credentials)?;
            let names: Vec<String> = streams::ALL_STREAM_NAMES.iter().map(|s| s.to_string()).collect();
            let built = streams::build(client, &config, &names);
            let catalog = catalog::discover(&built);
            println!("{}", serde_json::to_string(&catalog)?);
            Ok(())
        }
        Command::Read { config, catalog, state } => {
            let config = Config::load(&config)?;
            init_tracing(cli.debug || config.debug);
            read(config, catalog, state).await
        }
    }
}

async fn check(config: &Config) -> Result<(), SourceError> {
    let client = KlaviyoClient::new(&config.credentials)?;
    let cancel = CancellationToken::new();
    // A single cheap authenticated call validates both connectivity and
    // credentials without paging through a real stream.
    client.get_json("GET:/metrics/", "/metrics/", &[("page[size]".to_string(), "1".to_string())], &cancel)
        .await
        .map(|_| ())
}

async fn read(config: Config, catalog_path: PathBuf, state_path: Option<PathBuf>) -> Result<(), SourceError> {
    let raw = std::fs::read_to_string(&catalog_path)
        .map_err(|e| SourceError::Config(format!("reading {}: {e}", catalog_path.display())))?;
    let catalog: ConfiguredCatalog = serde_json::from_str(&raw)
        .map_err(|e| SourceError::Config(format!("parsing {}: {e}", catalog_path.display())))?;
    let names: Vec<String> = catalog.streams.into_iter().map(|s| s.name).collect();

    let state = match &state_path {
        Some(path) if path.exists() => {
            let raw = std::fs::read(path)?;
            StateManager::load(&raw)?
        }
        _ => StateManager::empty(),
    };

    let client = KlaviyoClient::new(&config.credentials)?;
    let built = streams::build(client, &config, &names);

    let driver_config = DriverConfig {
        max_stream_failures: config.max_stream_failures,
        max_slice_failures: config.max_slice_failures,
        backfill: config.backfill,
        initialize: config.initialize,
    };
    let driver = SyncDriver::new(built, driver_config);
    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let mut stdout = std::io::stdout().lock();
    let result = driver
        .run(&names, state, cancel, &mut |message| {
            if let Ok(line) = message.to_ndjson_line() {
                let _ = writeln!(stdout, "{line}");
            }
        })
        .await;
    drop(stdout);

    if let Ok(()) = &result {
        emit(&source_base::message::Message::success());
    }

    result
}

fn spec_document() -> serde_json::Value {
    json!({
        "documentationUrl": "https://developers.klaviyo.com/",
        "connectionSpecification": {
            "type": "object",
            "required": ["credentials"],
            "properties": {
                "credentials": {
                    "type": "object",
                    "oneOf": [
                        {
                            "title": "API Key",
                            "required": ["auth_type", "api_key"],
                            "properties": {
                                "auth_type": {"const": "api_key"},
                                "api_key": {"type": "string"},
                            },
                        },
                        {
                            "title": "OAuth2.0",
                            "required": ["auth_type", "client_id", "client_secret", "refresh_token"],
                            "properties": {
                                "auth_type": {"const": "oauth"},
                                "client_id": {"type": "string"},
                                "client_secret": {"type": "string"},
                                "refresh_token": {"type": "string"},
                            },
                        },
                    ],
                },
                "initialize": {"type": "boolean", "default": false},
                "backfill": {"type": "boolean", "default": false},
                "max_stream_failures": {"type": "integer", "default": -1},
                "max_slice_failures": {"type": "integer", "default": -1},
                "debug": {"type": "boolean", "default": false},
                "compress_state": {"type": "boolean", "default": true},
            },
        },
    })
}
