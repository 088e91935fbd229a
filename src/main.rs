use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rumornet::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "node")]
#[command(about = "UDP gossip node runtime", long_about = None)]
struct Args {
    /// UDP port to bind on 127.0.0.1.
    #[arg(long)]
    port: u16,

    /// Bootstrap peer as host:port. Pass this node's own address to run as
    /// the entry node.
    #[arg(long)]
    bootstrap: String,

    /// Forward degree for each new gossip.
    #[arg(long)]
    fanout: usize,

    /// Initial gossip hop budget.
    #[arg(long)]
    ttl: i64,

    /// Maximum peer table size.
    #[arg(long)]
    peer_limit: usize,

    /// Liveness probe period in seconds.
    #[arg(long)]
    ping_interval: f64,

    /// Staleness threshold in seconds before a peer is declared dead.
    #[arg(long)]
    peer_timeout: f64,

    /// RNG seed for reproducible sampling.
    #[arg(long)]
    seed: i64,

    /// IHAVE advertisement period in seconds (0 disables the pull loop).
    #[arg(long, default_value_t = 2.0)]
    pull_interval: f64,

    /// Maximum message ids per IHAVE.
    #[arg(long, default_value_t = 32)]
    ids_max_ihave: usize,

    /// Proof-of-work difficulty in leading hex zeros (0 disables).
    #[arg(long, default_value_t = 0)]
    k_pow: u32,

    /// Directory for the JSONL event file.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// GET_PEERS refresh period in seconds (0 disables the discovery loop).
    #[arg(long, default_value_t = 4.0)]
    discovery_interval: f64,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            bind_host: "127.0.0.1".to_string(),
            port: self.port,
            bootstrap: self.bootstrap,
            fanout: self.fanout,
            ttl: self.ttl,
            peer_limit: self.peer_limit,
            ping_interval_s: self.ping_interval,
            peer_timeout_s: self.peer_timeout,
            seed: self.seed,
            pull_interval_s: self.pull_interval,
            ids_max_ihave: self.ids_max_ihave,
            k_pow: self.k_pow,
            log_dir: self.log_dir,
            discovery_interval_s: self.discovery_interval,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::spawn(args.into_config()).await?;
    info!(
        addr = %node.local_addr(),
        node_id = %node.node_id(),
        log = %node.log_path().display(),
        "node started"
    );

    // Each non-empty stdin line originates one gossip with the line text as
    // data. EOF only ends origination; the node keeps serving until SIGINT.
    {
        let node = node.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if text.is_empty() {
                            continue;
                        }
                        match node.originate(text).await {
                            Some(msg_id) => info!(%msg_id, "gossip originated"),
                            None => warn!("gossip origination failed"),
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdin read failed, stopping origination loop");
                        break;
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    node.shutdown().await;
    Ok(())
}
