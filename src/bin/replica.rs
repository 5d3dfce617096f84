use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use raft_kv_store::{Config, ReplicaId, Replica, UdpTransport};

/// Runs one replica of the cluster: `replica <self-id> <peer-id> [<peer-id> ...]`. IDs are
/// four-hex-digit strings; `self-id` also names the UDP endpoint this replica listens on.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// This replica's four-hex-digit identifier, e.g. 0001.
    self_id: String,

    /// The other replicas in the cluster, by identifier.
    #[arg(num_args = 1..)]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let self_id: ReplicaId = cli
        .self_id
        .parse()
        .with_context(|| format!("invalid self id {:?}", cli.self_id))?;
    let peers = cli
        .peers
        .iter()
        .map(|p| p.parse::<ReplicaId>().with_context(|| format!("invalid peer id {p:?}")))
        .collect::<Result<Vec<_>>>()?;

    info!("starting replica {self_id}, peers: {peers:?}");

    let transport = UdpTransport::bind(self_id, &peers)
        .await
        .with_context(|| format!("binding UDP transport for {self_id}"))?;
    let config = Config::new(self_id, peers);
    let mut replica = Replica::new(config, transport);

    replica.run().await.context("replica event loop failed")
}
