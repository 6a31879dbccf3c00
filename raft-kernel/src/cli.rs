use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Raft node or talk to one", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start one cluster member with an operator console on stdin.
    Run(RunArgs),
    /// Send a single write to a node and print the reply.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Meta file: node id, cluster size, peer addresses, timeouts and persisted term.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub meta: PathBuf,

    /// Append-only file holding committed log entries.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub log: PathBuf,

    /// Listen here instead of this node's own entry in the meta file's `dns`.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Capacity of each per-peer send queue.
    #[arg(long, default_value_t = 256)]
    pub peer_queue: usize,

    /// Seconds a client may wait for its reply.
    #[arg(long, default_value_t = 5)]
    pub client_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the node to send the write to.
    #[arg(long, default_value = "127.0.0.1:7100")]
    pub server: String,

    /// Replicate through the log before answering (leader only).
    #[arg(long)]
    pub sync: bool,

    /// The command, e.g. `set a 1`.
    #[arg(required = true, trailing_var_arg = true)]
    pub payload: Vec<String>,
}
