use thiserror::Error;

/// Crate-local error type for the fallible operations the replica core performs internally.
///
/// Nothing in the event loop ever propagates one of these past a single dispatch: protocol-level
/// problems are turned into the appropriate wire reply, and `Transport`/`MalformedMessage` are
/// logged and the offending message dropped.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("invalid replica id {0:?}: must be exactly four hex digits")]
    InvalidReplicaId(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("message of {0} bytes exceeds the {1} byte datagram limit")]
    MessageTooLarge(usize, usize),

    #[error("no known address for replica {0}")]
    UnknownPeer(String),
}
