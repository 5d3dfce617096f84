use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// A replica (or client) identifier on the wire: exactly four hex digits, e.g. `01A3`.
///
/// `FFFF` is reserved to mean "unknown/broadcast leader" and is never the id of a real replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId([u8; 4]);

impl ReplicaId {
    pub const BROADCAST: ReplicaId = ReplicaId([b'F', b'F', b'F', b'F']);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_str(&self) -> &str {
        // Safe: constructed only from ASCII hex digits.
        std::str::from_utf8(&self.0).unwrap()
    }
}

impl FromStr for ReplicaId {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(RaftError::InvalidReplicaId(s.to_string()));
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(bytes);
        Ok(ReplicaId(id))
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = RaftError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ReplicaId> for String {
    fn from(id: ReplicaId) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
