//! Operational tool for Rserve backends: start, stop, and probe the
//! servers a pool configuration names.
//!
//! Exactly one action is required:
//!
//! ```text
//! reservoirctl --startup  [--host h] [--port p] [--configuration file]
//! reservoirctl --shutdown [--host h] [--port p] [-u user -p pass]
//! reservoirctl --validate --configuration reservoir.toml
//! ```
//!
//! Exit codes: `0` success, `1` shutdown failed, `2` startup failed, `3`
//! one or more hosts in a multi-host configuration failed, `42` validate
//! reported a DOWN endpoint.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use reservoir::config::{PoolConfig, ServerConfig, default_command};
use reservoir::driver;
use reservoir::endpoint::ServerEndpoint;
use reservoir::engine::qap::QapConnector;
use reservoir::telemetry::{LogFormat, init_logging};

#[derive(Parser)]
#[command(
    name = "reservoirctl",
    about = "Start, stop, and probe Rserve backends",
    version
)]
struct Cli {
    #[command(flatten)]
    action: Action,

    /// Host running (or to run) the Rserve process
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port the Rserve process listens on
    #[arg(long, default_value_t = reservoir::constants::DEFAULT_RSERVE_PORT)]
    port: u16,

    /// Username to send to the Rserve process
    #[arg(short, long)]
    username: Option<String>,

    /// Password to send to the Rserve process
    #[arg(short, long)]
    password: Option<String>,

    /// Pool configuration file; acts on every server it lists
    #[arg(short, long)]
    configuration: Option<PathBuf>,
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct Action {
    /// Start Rserve processes
    #[arg(long)]
    startup: bool,

    /// Shut down running Rserve processes
    #[arg(long)]
    shutdown: bool,

    /// Probe each endpoint and report UP or DOWN
    #[arg(long)]
    validate: bool,
}

const EXIT_SHUTDOWN_FAILED: u8 = 1;
const EXIT_STARTUP_FAILED: u8 = 2;
const EXIT_MULTI_HOST_FAILED: u8 = 3;
const EXIT_VALIDATE_DOWN: u8 = 42;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging(LogFormat::from_env()) {
        eprintln!("cannot initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let servers: Vec<ServerConfig> = match &cli.configuration {
        Some(path) => match PoolConfig::from_file(path) {
            Ok(config) => config.servers,
            Err(e) => {
                eprintln!("cannot read configuration {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            let mut server = ServerConfig::new(cli.host.clone());
            server.port = cli.port;
            server.username = cli.username.clone();
            server.password = cli.password.clone();
            vec![server]
        }
    };
    let multi_host = cli.configuration.is_some();

    let connector = QapConnector::new();
    let mut failures = 0usize;
    let mut down = 0usize;

    for server in &servers {
        let endpoint = match server.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                eprintln!("invalid server entry: {}", e);
                failures += 1;
                continue;
            }
        };

        if cli.action.validate {
            if driver::validate(&connector, &endpoint).await {
                println!("{} is UP", endpoint);
            } else {
                println!("{} is DOWN", endpoint);
                down += 1;
            }
        } else if cli.action.shutdown {
            if let Err(e) = driver::shutdown_server(&connector, &endpoint).await {
                // Let the user know and keep trying the other servers.
                eprintln!("could not shut down {}: {}", endpoint, e);
                failures += 1;
            }
        } else if cli.action.startup {
            if let Err(e) = start_server(&endpoint, &server.command).await {
                eprintln!("could not start {}: {}", endpoint, e);
                failures += 1;
            }
        }
    }

    if cli.action.validate {
        return if down > 0 {
            ExitCode::from(EXIT_VALIDATE_DOWN)
        } else {
            ExitCode::SUCCESS
        };
    }
    if failures == 0 {
        return ExitCode::SUCCESS;
    }
    ExitCode::from(if multi_host {
        EXIT_MULTI_HOST_FAILED
    } else if cli.action.shutdown {
        EXIT_SHUTDOWN_FAILED
    } else {
        EXIT_STARTUP_FAILED
    })
}

async fn start_server(
    endpoint: &ServerEndpoint,
    command: &str,
) -> reservoir::error::Result<()> {
    let command = if command.trim().is_empty() {
        default_command()
    } else {
        command.to_string()
    };
    let exit = driver::startup(endpoint, &command).await?;

    // Rserve detaches into the background; the launch command itself is
    // expected to terminate promptly.
    let code = exit
        .await
        .map_err(|e| reservoir::error::Error::Connect(e.to_string()))??;
    if code != 0 {
        return Err(reservoir::error::Error::Connect(format!(
            "launch command exited with status {}",
            code
        )));
    }
    Ok(())
}
