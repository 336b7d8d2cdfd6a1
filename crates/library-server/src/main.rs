//! Server implementation

#![warn(missing_docs)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use library_server::Serving;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line options
#[derive(Debug, Parser)]
#[command(name = "library-server", version, about = "Library book reservation system")]
struct Opts {
    /// Address for the HTTP server to listen on
    #[arg(long, default_value = "0.0.0.0", global = true)]
    host: String,

    /// Port for the HTTP server to listen on [default: 8080 for a replica,
    /// 8000 for the proxy]
    #[arg(long, env = "PORT", global = true)]
    port: Option<u16>,

    /// Directory holding the `config_{environment}.json` files
    #[arg(long, default_value = ".", global = true)]
    config: PathBuf,

    /// Environment whose configuration file is loaded
    #[arg(long, env = "ENVIRONMENT", default_value = "dev", global = true)]
    environment: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Serve the catalog and reservation API
    Replica,
    /// Balance requests across the configured replicas
    Proxy,
}

impl Command {
    fn default_port(self) -> u16 {
        match self {
            Command::Replica => 8080,
            Command::Proxy => 8000,
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> eyre::Result<()> {
    let opts = Opts::parse();

    let config = library_server::load_config(&opts.config, &opts.environment)
        .wrap_err_with(|| format!("loading configuration for `{}`", opts.environment))?;
    init_tracing(&config.log_level);

    let port = opts.port.unwrap_or_else(|| opts.command.default_port());
    let server = tiny_http::Server::http((opts.host.as_str(), port))
        .map_err(|e| eyre!("could not listen on {}:{port}: {e}", opts.host))?;
    info!(host = %opts.host, port, environment = %config.environment, command = ?opts.command, "listening");

    // The handler threads never stop on their own; the process runs until it
    // is killed.
    let threads = config.handler_threads;
    match opts.command {
        Command::Replica => {
            let replica = library_engine::launch(&config)?;
            Serving::spawn(server, replica, "replica", threads)?.join();
        }
        Command::Proxy => {
            let proxy = library_engine::launch_proxy(&config)?;
            Serving::spawn(server, proxy, "proxy", threads)?.join();
        }
    }
    Ok(())
}
