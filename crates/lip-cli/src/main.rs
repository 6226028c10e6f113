//! LIP command line - host demo function servers and call functions.

mod commands;
mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lip")]
#[command(about = "Local inter-process function calls")]
struct Args {
    /// Directory holding function endpoints (defaults to $LIP_NAMESPACE_DIR or the temp dir)
    #[arg(long, global = true)]
    namespace: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo functions until interrupted
    Serve {
        /// Result cache capacity of the cached demo functions (0 = unbounded)
        #[arg(long, default_value_t = 128)]
        lru: usize,

        /// Only serve these functions
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },
    /// List reachable functions
    List,
    /// Print the docstring of a function
    Doc { name: String },
    /// Call a function and print its JSON result
    Call {
        name: String,

        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Positional arguments, parsed as JSON when possible
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Ask a function server to shut down
    Stop { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let namespace = args
        .namespace
        .unwrap_or_else(lip_core::default_namespace_dir);

    match args.command {
        Command::Serve { lru, only } => commands::serve(namespace, lru, &only).await,
        Command::List => commands::list(namespace).await,
        Command::Doc { name } => commands::doc(namespace, &name).await,
        Command::Call {
            name,
            kwargs,
            timeout_ms,
            args,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            commands::call(namespace, &name, &args, kwargs.as_deref(), timeout).await
        }
        Command::Stop { name } => commands::stop(namespace, &name).await,
    }
}
