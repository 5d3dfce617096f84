use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use raft_kv_store::{address_of, Body, Message, ReplicaId};

const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 10;

/// A minimal client for the replicated key-value store: sends one `get` or `put` and follows
/// `redirect` replies to the believed leader, retrying on `fail` or on a timed-out reply.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// This client's four-hex-digit identifier, e.g. C001.
    #[arg(long, default_value = "C001")]
    id: String,

    /// A replica to contact first; further hops follow `redirect` replies.
    #[arg(long)]
    replica: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Get { key: String },
    Put { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let client_id: ReplicaId = cli
        .id
        .parse()
        .with_context(|| format!("invalid client id {:?}", cli.id))?;
    let mut target: ReplicaId = cli
        .replica
        .parse()
        .with_context(|| format!("invalid replica id {:?}", cli.replica))?;

    let body = match cli.command {
        Commands::Get { key } => Body::Get { key },
        Commands::Put { key, value } => Body::Put { key, value },
    };
    let mid = format!("{client_id}-{}", std::process::id());

    let socket = UdpSocket::bind(("127.0.0.1", 0)).await.context("binding client socket")?;

    for attempt in 1..=MAX_ATTEMPTS {
        let request = Message {
            src: client_id,
            dst: target,
            leader: ReplicaId::BROADCAST,
            term: 0,
            mid: Some(mid.clone()),
            body: body.clone(),
        };
        let bytes = serde_json::to_vec(&request).context("encoding request")?;
        socket
            .send_to(&bytes, address_of(target))
            .await
            .with_context(|| format!("sending to {target} (attempt {attempt})"))?;

        let mut buf = vec![0u8; Message::MAX_WIRE_BYTES];
        let reply = match timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => serde_json::from_slice::<Message>(&buf[..len]),
            Ok(Err(e)) => {
                warn!("socket error on attempt {attempt}: {e}");
                continue;
            }
            Err(_elapsed) => {
                debug!("no reply from {target} within {REPLY_TIMEOUT:?}, retrying");
                continue;
            }
        };

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                warn!("malformed reply on attempt {attempt}: {e}");
                continue;
            }
        };

        match reply.body {
            Body::Ok { value, .. } => {
                match value {
                    Some(v) => println!("{v}"),
                    None => println!("ok"),
                }
                return Ok(());
            }
            Body::Fail { .. } => {
                debug!("{target} replied fail (attempt {attempt}), retrying after backoff");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Body::Redirect {} => {
                info!("{target} redirected us to {}", reply.leader);
                if !reply.leader.is_broadcast() {
                    target = reply.leader;
                }
            }
            other => {
                warn!("unexpected reply body on attempt {attempt}: {other:?}");
            }
        }
    }

    bail!("giving up after {MAX_ATTEMPTS} attempts, last target {target}");
}
