//! buildmesh node binary.
//!
//! Runs a worker that executes dispatched tasks, dispatches a single task to
//! a discovered worker, or lists the peers in a brokerage.

use tracing_subscriber::EnvFilter;

use buildmesh_node::cli::Cli;
use buildmesh_node::node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging; task output goes to stdout so logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    node::run(&cli).await
}
