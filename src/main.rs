use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use castle_cron::catalog::Catalog;
use castle_cron::cli;
use castle_cron::config::{ServerConfig, DEFAULT_SESSION_TIMEOUT_SECS};
use castle_cron::server::{ensure_namespace, Server};
use castle_cron::shutdown::install_shutdown_handler;
use castle_cron::store::etcd::EtcdStore;
use castle_cron::store::Store;

#[derive(Parser, Debug)]
#[command(name = "castle-cron")]
#[command(about = "A distributed, highly available cron job scheduler")]
#[command(disable_help_subcommand = true)]
struct Args {
    /// Run as a castle-cron server daemon
    #[arg(short, long)]
    server: bool,

    /// Server name template; %h expands to the hostname, %p to the pid
    #[arg(short, long)]
    name: Option<String>,

    /// Start even if a server with the same name is already registered
    #[arg(short, long)]
    force: bool,

    /// Comma-separated coordination store endpoints (host:port)
    #[arg(long, env = "CASTLE_CRON_ENDPOINTS", default_value = "127.0.0.1:2379")]
    endpoints: String,

    /// Store session timeout in seconds
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
    session_timeout: u64,

    /// Enable TRACE logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<CatalogCommand>,
}

#[derive(Subcommand, Debug)]
enum CatalogCommand {
    /// Add a new job to the schedule
    Add {
        /// Name of job; must be unique
        name: String,
        /// cron-like schedule string; see `help sched`
        schedule: String,
        /// Command to run
        cmd: String,
        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Update a job in the schedule
    Upd {
        /// Name of job; must already exist
        name: String,
        /// cron-like schedule string; see `help sched`
        schedule: String,
        /// Command to run
        cmd: String,
        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Delete a job from the schedule
    Del {
        /// Name of job; must already exist
        name: String,
    },
    /// List scheduled jobs
    List {
        /// Name pattern; * matches one or more characters
        pattern: Option<String>,
    },
    /// Show help for a subcommand or for the schedule string format
    Help {
        /// One of add, upd, del, list, sched
        topic: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Help needs no store connection.
    if let Some(CatalogCommand::Help { topic }) = &args.command {
        return match cli::help_text(topic.as_deref()) {
            Some(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("Unknown help topic; must be add, upd, del, list, or sched");
                ExitCode::from(2)
            }
        };
    }

    if !args.server && args.command.is_none() {
        eprintln!("Nothing to do: pass --server and/or a subcommand (see --help)");
        return ExitCode::from(2);
    }

    let config = ServerConfig {
        endpoints: args
            .endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        session_timeout: Duration::from_secs(args.session_timeout),
        name_template: args.name.clone(),
        force: args.force,
    };
    if config.endpoints.is_empty() {
        eprintln!("No coordination store endpoints provided");
        return ExitCode::from(2);
    }

    let store = match EtcdStore::connect(&config.endpoints, config.session_timeout).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, endpoints = ?config.endpoints, "Unable to connect to coordination store");
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        endpoints = ?config.endpoints,
        session_timeout_secs = config.session_timeout.as_secs(),
        "Connected to coordination store"
    );

    if let Err(e) = ensure_namespace(store.as_ref()).await {
        tracing::error!(error = %e, "Unable to initialize namespace");
        store.close().await;
        return ExitCode::from(1);
    }

    if let Some(command) = args.command {
        let catalog = Catalog::new(store.clone());
        let result = match command {
            CatalogCommand::Add {
                name,
                schedule,
                cmd,
                args,
            } => cli::add(&store, &catalog, &name, &schedule, &cmd, args).await,
            CatalogCommand::Upd {
                name,
                schedule,
                cmd,
                args,
            } => cli::upd(&store, &catalog, &name, &schedule, &cmd, args).await,
            CatalogCommand::Del { name } => cli::del(&store, &catalog, &name).await,
            CatalogCommand::List { pattern } => cli::list(&catalog, pattern.as_deref()).await,
            // Handled before the store connection.
            CatalogCommand::Help { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Command failed");
            store.close().await;
            return ExitCode::from(1);
        }
    }

    if args.server {
        let shutdown = install_shutdown_handler();
        let server = Server::new(store.clone(), config, shutdown);
        let result = server.run().await;
        server.stop().await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server terminated");
            return ExitCode::from(1);
        }
        return ExitCode::SUCCESS;
    }

    store.close().await;
    ExitCode::SUCCESS
}
