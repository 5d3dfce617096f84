use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::net::UdpSocket;

use crate::config::BASE_PORT;
use crate::error::RaftError;
use crate::id::ReplicaId;
use crate::message::Message;

/// Point-to-point datagram fabric a replica sends and receives framed JSON messages over.
///
/// This is the seam the cluster simulator/transport plugs into in production; tests substitute
/// an in-memory bus (see `tests/cluster.rs`) that can drop, duplicate, and reorder datagrams
/// without opening real sockets.
#[async_trait]
pub trait Transport: Send {
    /// Send `msg` to `msg.dst`. Best-effort: message loss is expected and handled by the
    /// protocol's timers, not by this trait.
    async fn send(&mut self, msg: &Message) -> Result<(), RaftError>;

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout with nothing received.
    /// `Err` only for a genuine transport-level failure or an unparseable datagram; callers log
    /// and drop rather than propagate further.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, RaftError>;
}

/// Resolves a replica id to its fixed local-host UDP address (see `BASE_PORT`). Exposed so the
/// client binary can reach a named replica without duplicating the port convention.
pub fn address_of(id: ReplicaId) -> SocketAddr {
    let port = BASE_PORT + u16::from_str_radix(id.as_str(), 16).unwrap_or(0);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// UDP-backed `Transport`: binds one socket per replica at a fixed local-host port derived from
/// its id, and exchanges single-datagram JSON messages with peers bound the same way.
pub struct UdpTransport {
    socket: UdpSocket,
    addresses: HashMap<ReplicaId, SocketAddr>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    pub async fn bind(self_id: ReplicaId, peers: &[ReplicaId]) -> Result<Self, RaftError> {
        let socket = UdpSocket::bind(address_of(self_id)).await?;
        let mut addresses = HashMap::new();
        addresses.insert(self_id, address_of(self_id));
        for &peer in peers {
            addresses.insert(peer, address_of(peer));
        }
        Ok(UdpTransport {
            socket,
            addresses,
            recv_buf: vec![0u8; Message::MAX_WIRE_BYTES],
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, msg: &Message) -> Result<(), RaftError> {
        let addr = *self
            .addresses
            .get(&msg.dst)
            .ok_or_else(|| RaftError::UnknownPeer(msg.dst.to_string()))?;
        let bytes = serde_json::to_vec(msg)?;
        if bytes.len() > Message::MAX_WIRE_BYTES {
            return Err(RaftError::MessageTooLarge(bytes.len(), Message::MAX_WIRE_BYTES));
        }
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, RaftError> {
        let recv = tokio::time::timeout(timeout, self.socket.recv_from(&mut self.recv_buf)).await;
        let (len, _from) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(RaftError::Transport(e)),
            Err(_elapsed) => return Ok(None),
        };
        match serde_json::from_slice::<Message>(&self.recv_buf[..len]) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!("dropping malformed datagram ({len} bytes): {e}");
                Err(RaftError::MalformedMessage(e))
            }
        }
    }
}
