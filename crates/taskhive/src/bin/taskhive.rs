use std::path::PathBuf;

use clap::{Parser, Subcommand};

use taskhive::common::setup::setup_logging;
use taskhive::server::bootstrap::{start_server, stop_server};
use taskhive::server::config::{DEFAULT_ACCESS_FILE, ServerConfig};
use taskhive::worker::bootstrap::{WorkerStartOpts, start_worker};

#[derive(Parser)]
#[command(author, version, about)]
struct RootOptions {
    /// Enables more verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Commands for the server
    Server {
        #[command(subcommand)]
        subcmd: ServerCommand,
    },
    /// Commands for workers
    Worker {
        #[command(subcommand)]
        subcmd: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Starts the server
    Start {
        /// TOML file with the server configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Journal file; overrides the configuration file
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Access file; overrides the configuration file
        #[arg(long)]
        access_file: Option<PathBuf>,
    },
    /// Stops the server
    Stop {
        #[arg(long, default_value = DEFAULT_ACCESS_FILE)]
        access_file: PathBuf,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Starts a worker and connects it to the server
    Start(WorkerStartOpts),
}

async fn command_server_start(
    config: Option<PathBuf>,
    journal: Option<PathBuf>,
    access_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    if journal.is_some() {
        config.journal = journal;
    }
    if let Some(access_file) = access_file {
        config.access_file = access_file;
    }
    start_server(config).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let options = RootOptions::parse();
    setup_logging(options.debug);

    let result = match options.subcmd {
        SubCommand::Server {
            subcmd:
                ServerCommand::Start {
                    config,
                    journal,
                    access_file,
                },
        } => command_server_start(config, journal, access_file).await,
        SubCommand::Server {
            subcmd: ServerCommand::Stop { access_file },
        } => stop_server(&access_file).await,
        SubCommand::Worker {
            subcmd: WorkerCommand::Start(opts),
        } => start_worker(opts).await,
    };

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }
}
