//! `raft-node`: run a cluster member, or send it a write.
//!
//! ```bash
//! # one terminal per member; each meta file names its own id
//! raft-node run --meta node0.json --log node0.log
//! raft-node run --meta node1.json --log node1.log
//! raft-node run --meta node2.json --log node2.log
//!
//! raft-node client --server 127.0.0.1:7100 --sync set a 1
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use raft_kernel::cli::{Cli, ClientArgs, Command, RunArgs};
use raft_kernel::console::{ConsoleCommand, HELP};
use raft_kernel::runtime::{start_tcp_node, NodeHandle, TcpNode};
use raft_kernel::transport::{self, TransportConfig};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Client(args) => client(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = TransportConfig {
        peer_queue: args.peer_queue,
        client_timeout: Duration::from_secs(args.client_timeout),
    };
    let TcpNode {
        handle,
        latency,
        local_addr,
    } = start_tcp_node(&args.meta, &args.log, args.listen, config).await?;
    info!(node = handle.id(), addr = %local_addr, "node running, type HELP for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
            _ = wait_stopped(&handle) => break,
        };
        let Some(line) = line else {
            let _ = handle.shutdown();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Status) => match handle.describe().await {
                Ok(text) => println!("{text}"),
                Err(err) => warn!(error = %err, "status unavailable"),
            },
            Ok(ConsoleCommand::Log) => {
                let log = handle.log();
                println!("committed {}", log.committed());
                for entry in log.snapshot() {
                    println!("{} {}", entry.key, entry.payload);
                }
            }
            Ok(ConsoleCommand::Delay { ms, jitter }) => {
                latency.set(ms, jitter);
                println!("peer messages now delayed by {ms}ms + rand(0..={jitter})ms");
            }
            Ok(ConsoleCommand::Help) => println!("{HELP}"),
            Ok(ConsoleCommand::Exit) => {
                let _ = handle.shutdown();
                break;
            }
            Err(err) => println!("{err}"),
        }
    }

    match handle.join().await? {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "node stopped on a fatal error");
            Err(err.into())
        }
    }
}

async fn wait_stopped(handle: &NodeHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn client(args: ClientArgs) -> Result<()> {
    let payload = args.payload.join(" ");
    let reply = transport::request(&args.server, args.sync, payload).await?;
    if reply.ok {
        println!("{}", reply.output);
        Ok(())
    } else {
        anyhow::bail!("request failed: {}", reply.output)
    }
}
