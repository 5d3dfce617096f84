use serde::{Deserialize, Serialize};

use crate::id::ReplicaId;
use crate::log::{LogCommand, LogEntry};

/// On-the-wire representation of a single log entry, per the `{term, command, src?, MID?, key?,
/// value?}` shape in the wire contract. Kept distinct from `LogEntry`/`LogCommand` so the internal
/// sum-type representation doesn't leak optional fields into the rest of the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub term: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<ReplicaId>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "MID")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl From<&LogEntry> for WireEntry {
    fn from(entry: &LogEntry) -> Self {
        match &entry.command {
            LogCommand::Sentinel => WireEntry {
                term: entry.term,
                command: "none".to_string(),
                src: None,
                mid: None,
                key: None,
                value: None,
            },
            LogCommand::NoOp => WireEntry {
                term: entry.term,
                command: "NO_OP".to_string(),
                src: None,
                mid: None,
                key: None,
                value: None,
            },
            LogCommand::Put {
                src,
                mid,
                key,
                value,
            } => WireEntry {
                term: entry.term,
                command: "put".to_string(),
                src: Some(*src),
                mid: Some(mid.clone()),
                key: Some(key.clone()),
                value: Some(value.clone()),
            },
        }
    }
}

/// Error converting a `WireEntry` back into a `LogEntry`: the wire gave us a `put` without the
/// fields a put requires, or a command tag we don't understand.
#[derive(Debug, thiserror::Error)]
pub enum WireEntryError {
    #[error("put entry missing required field {0}")]
    MissingField(&'static str),
    #[error("unknown log command tag {0:?}")]
    UnknownCommand(String),
}

impl TryFrom<WireEntry> for LogEntry {
    type Error = WireEntryError;

    fn try_from(w: WireEntry) -> Result<Self, Self::Error> {
        let command = match w.command.as_str() {
            "none" => LogCommand::Sentinel,
            "NO_OP" => LogCommand::NoOp,
            "put" => LogCommand::Put {
                src: w.src.ok_or(WireEntryError::MissingField("src"))?,
                mid: w.mid.ok_or(WireEntryError::MissingField("MID"))?,
                key: w.key.ok_or(WireEntryError::MissingField("key"))?,
                value: w.value.ok_or(WireEntryError::MissingField("value"))?,
            },
            other => return Err(WireEntryError::UnknownCommand(other.to_string())),
        };
        Ok(LogEntry {
            term: w.term,
            command,
        })
    }
}

/// A full message on the wire: the shared envelope fields plus a tagged body.
///
/// The body is flattened into the envelope so the JSON is the single flat object the wire
/// contract describes, not `{"src": ..., "body": {"type": ..., ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub src: ReplicaId,
    pub dst: ReplicaId,
    pub leader: ReplicaId,
    pub term: u64,
    #[serde(rename = "MID", default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Get {
        key: String,
    },
    Put {
        key: String,
        value: String,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev_log_idx: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entries: Option<Vec<WireEntry>>,
    },
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term_first_idx: Option<u64>,
    },
    Redirect {},
    RequestVote {
        last_log_idx: u64,
        last_log_term: u64,
    },
    ResponseVote {
        value: bool,
    },
    AppendEntries {
        prev_log_idx: u64,
        prev_log_term: u64,
        entries: Vec<WireEntry>,
        leader_commit: u64,
    },
}

impl Message {
    /// Bound from the wire contract: every datagram is at most 32768 bytes.
    pub const MAX_WIRE_BYTES: usize = 32_768;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        s.parse().unwrap()
    }

    #[test]
    fn get_roundtrips_as_flat_json() {
        let msg = Message {
            src: id("0001"),
            dst: id("0002"),
            leader: ReplicaId::BROADCAST,
            term: 3,
            mid: Some("m1".into()),
            body: Body::Get { key: "x".into() },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "get");
        assert_eq!(json["key"], "x");
        assert_eq!(json["MID"], "m1");
        assert_eq!(json["src"], "0001");

        let back: Message = serde_json::from_value(json).unwrap();
        match back.body {
            Body::Get { key } => assert_eq!(key, "x"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn append_entries_roundtrips_with_entries() {
        let msg = Message {
            src: id("0001"),
            dst: id("0002"),
            leader: id("0001"),
            term: 2,
            mid: None,
            body: Body::AppendEntries {
                prev_log_idx: 1,
                prev_log_term: 1,
                entries: vec![WireEntry {
                    term: 2,
                    command: "put".into(),
                    src: Some(id("0003")),
                    mid: Some("c1".into()),
                    key: Some("k".into()),
                    value: Some("v".into()),
                }],
                leader_commit: 1,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back.body {
            Body::AppendEntries { entries, .. } => assert_eq!(entries.len(), 1),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn wire_entry_roundtrips_through_log_entry() {
        let entry = LogEntry {
            term: 5,
            command: LogCommand::Put {
                src: id("0001"),
                mid: "m".into(),
                key: "k".into(),
                value: "v".into(),
            },
        };
        let wire = WireEntry::from(&entry);
        let back: LogEntry = wire.try_into().unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn sentinel_and_no_op_round_trip() {
        let sentinel = LogEntry::sentinel();
        let back: LogEntry = WireEntry::from(&sentinel).try_into().unwrap();
        assert_eq!(back, sentinel);

        let no_op = LogEntry {
            term: 4,
            command: LogCommand::NoOp,
        };
        let back: LogEntry = WireEntry::from(&no_op).try_into().unwrap();
        assert_eq!(back, no_op);
    }
}
