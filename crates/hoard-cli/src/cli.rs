use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "hoard",
    about = "Hoard: a shared-memory object store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store socket (overrides the configured `socket_path`)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    pub log_level: tracing::Level,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a store server
    Serve(ConfigArgs),
    /// Print the effective server configuration
    Info(ConfigArgs),
    /// Store a file (or stdin) as a sealed object
    Put(PutArgs),
    /// Write an object's data to a file or stdout
    Get(GetArgs),
    /// Report whether an object exists and is sealed
    Contains(IdArgs),
    /// Delete an unreferenced object
    Delete(IdArgs),
    /// Push a sealed object to a peer store
    Transfer(TransferArgs),
    /// Print object ids as they are sealed
    Watch(WatchArgs),
}

#[derive(Args, Default)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub arena_size: Option<u64>,
    #[arg(long)]
    pub arena_dir: Option<PathBuf>,
    #[arg(long)]
    pub manager_addr: Option<IpAddr>,
    #[arg(long)]
    pub manager_port: Option<u16>,
    #[arg(long)]
    pub get_timeout_ms: Option<u64>,
    #[arg(long)]
    pub transfer_timeout_ms: Option<u64>,
    /// Close subscribers that leave notifications unread this long
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,
    #[arg(long)]
    pub notification_capacity: Option<usize>,
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args)]
pub struct PutArgs {
    /// Object id as 40 hex characters; random when omitted
    #[arg(long)]
    pub id: Option<String>,
    /// Read data from this file instead of stdin
    #[arg(short, long)]
    pub file: Option<PathBuf>,
    #[arg(short, long, default_value = "")]
    pub metadata: String,
}

#[derive(Args)]
pub struct GetArgs {
    pub id: String,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Write data here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct IdArgs {
    pub id: String,
}

#[derive(Args)]
pub struct TransferArgs {
    pub id: String,
    /// Transfer listener of the destination store
    pub peer: SocketAddr,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Stop after this many notifications
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}
