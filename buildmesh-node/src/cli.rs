//! Command-line argument parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use buildmesh_net::{PeerMode, DEFAULT_PORT};
use clap::{Args, Parser, Subcommand};

/// Brokerless task dispatch node.
#[derive(Parser, Debug, Clone)]
#[command(name = "buildmesh-node")]
#[command(about = "Run a buildmesh worker or dispatch tasks to one")]
#[command(version)]
pub struct Cli {
    /// Shared brokerage directory.
    #[arg(long, global = true, default_value = "~/.buildmesh/brokerage")]
    pub brokerage: PathBuf,

    /// File holding the base64 application key.
    #[arg(long, global = true, default_value = "~/.buildmesh/app.key")]
    pub app_key_file: PathBuf,

    /// File holding the base64 identity; a fresh identity is used if absent.
    #[arg(long, global = true, default_value = "~/.buildmesh/identity.key")]
    pub identity_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Accept tasks until interrupted.
    Worker(WorkerArgs),
    /// Run one task on a discovered worker.
    Dispatch(DispatchArgs),
    /// List peers in the brokerage.
    Peers(PeersArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on; 0 picks a free one.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Advertised availability (disabled, idle, dedicated).
    #[arg(long, default_value = "dedicated")]
    pub mode: PeerMode,

    /// Advertised thread limit; 0 for no limit.
    #[arg(long, default_value_t = 0)]
    pub max_threads: u32,

    /// Advertised free-memory floor in bytes.
    #[arg(long, default_value_t = 0)]
    pub min_free_memory: u64,

    /// Comma-separated addresses to advertise instead of the detected ones.
    #[arg(long, value_delimiter = ',')]
    pub advertise_ip: Option<Vec<IpAddr>>,

    /// Seconds between brokerage re-announcements.
    #[arg(long, default_value_t = 60)]
    pub announce_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    /// Seconds to wait for a free worker.
    #[arg(long, default_value_t = 10)]
    pub wait: u64,

    /// Working directory on the worker.
    #[arg(long, default_value = "")]
    pub cwd: String,

    /// Extra environment variables as KEY=VALUE.
    #[arg(long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Program to run.
    pub executable: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub arguments: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PeersArgs {
    /// Output in JSON format for machine parsing.
    #[arg(long)]
    pub json: bool,
}

fn parse_env(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", text)),
    }
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
