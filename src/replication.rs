use std::time::Instant;

use log::{info, warn};

use crate::config::{APPEND_ENTRIES_BATCH_CAP, HEARTBEAT_INTERVAL, SEND_FREQ};
use crate::error::RaftError;
use crate::id::ReplicaId;
use crate::log::LogEntry;
use crate::message::{Body, Message, WireEntry};
use crate::replica::Replica;
use crate::transport::Transport;

impl<T: Transport> Replica<T> {
    /// Sends one AppendEntries to `peer`: `prev_idx`/`prev_term` from `next_idx[peer]`, and up to
    /// `APPEND_ENTRIES_BATCH_CAP` entries following it. Used for both heartbeats (where the slice
    /// may be empty) and catch-up sends.
    async fn send_append_entries_to(&mut self, peer: ReplicaId, now: Instant) -> Result<(), RaftError> {
        let next = *self.next_idx.get(&peer).unwrap_or(&1);
        let prev_idx = next.saturating_sub(1);
        let prev_term = self.log.entry(prev_idx).map(|e| e.term).unwrap_or(0);
        let entries: Vec<WireEntry> = self
            .log
            .slice_from(next)
            .iter()
            .take(APPEND_ENTRIES_BATCH_CAP)
            .map(WireEntry::from)
            .collect();

        let msg = self.envelope(
            peer,
            None,
            Body::AppendEntries {
                prev_log_idx: prev_idx,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_idx,
            },
        );
        self.last_peer_send.insert(peer, now);
        self.transport.send(&msg).await
    }

    /// Unthrottled: every peer, every `HEARTBEAT_INTERVAL`, regardless of match state. This is
    /// what asserts leadership and is the only path that advances a fully caught-up follower's
    /// commit index.
    pub(crate) async fn broadcast_heartbeat(&mut self, now: Instant) -> Result<(), RaftError> {
        let peers = self.config.peers.clone();
        for peer in peers {
            self.send_append_entries_to(peer, now).await?;
        }
        self.last_heartbeat_sent = now;
        Ok(())
    }

    pub(crate) async fn send_heartbeat_if_due(&mut self, now: Instant) -> Result<(), RaftError> {
        if now.duration_since(self.last_heartbeat_sent) >= HEARTBEAT_INTERVAL {
            self.broadcast_heartbeat(now).await?;
        }
        Ok(())
    }

    /// Throttled by `SEND_FREQ`, and only to peers known to be behind (`match_idx[p] <
    /// last_index()`). The unthrottled heartbeat path above covers peers that are caught up.
    pub(crate) async fn send_catch_up(&mut self, now: Instant) -> Result<(), RaftError> {
        let last_index = self.log.last_index();
        let due: Vec<ReplicaId> = self
            .config
            .peers
            .iter()
            .copied()
            .filter(|p| {
                let behind = *self.match_idx.get(p).unwrap_or(&0) < last_index;
                let due = now.duration_since(*self.last_peer_send.get(p).unwrap_or(&now)) >= SEND_FREQ;
                behind && due
            })
            .collect();
        for peer in due {
            self.send_append_entries_to(peer, now).await?;
        }
        Ok(())
    }

    /// Follower-side AppendEntries handling, per the four-step protocol: reject stale terms,
    /// adopt the sender as leader, reject on a prefix mismatch, else truncate/append and advance
    /// the local commit index.
    pub(crate) async fn handle_append_entries(&mut self, msg: Message, now: Instant) -> Result<(), RaftError> {
        let (prev_log_idx, prev_log_term, entries, leader_commit) = match &msg.body {
            Body::AppendEntries {
                prev_log_idx,
                prev_log_term,
                entries,
                leader_commit,
            } => (*prev_log_idx, *prev_log_term, entries.clone(), *leader_commit),
            _ => unreachable!("handle_append_entries called with non-AppendEntries body"),
        };

        if msg.term < self.current_term {
            let reply = self.envelope(
                msg.src,
                None,
                Body::Fail {
                    term_first_idx: Some(self.log.first_index_of_term_at(prev_log_idx)),
                },
            );
            return self.transport.send(&reply).await;
        }

        // Adopts this message's term/leader even when `msg.term == current_term`: a Candidate
        // that just lost an election it didn't know was already decided steps down here.
        self.become_follower(msg.term, Some(msg.src), now).await?;

        if !self.log.prefix_matches(prev_log_idx, prev_log_term) {
            let reply = self.envelope(
                msg.src,
                None,
                Body::Fail {
                    term_first_idx: Some(self.log.first_index_of_term_at(prev_log_idx)),
                },
            );
            return self.transport.send(&reply).await;
        }

        let mut new_entries = Vec::with_capacity(entries.len());
        for wire in entries.iter().cloned() {
            match LogEntry::try_from(wire) {
                Ok(entry) => new_entries.push(entry),
                Err(err) => {
                    warn!("malformed AppendEntries entry from {}: {err}", msg.src);
                    let reply = self.envelope(msg.src, None, Body::Fail { term_first_idx: None });
                    return self.transport.send(&reply).await;
                }
            }
        }

        if !new_entries.is_empty() && prev_log_idx + 1 <= self.log.last_index() {
            self.log.truncate_from(prev_log_idx + 1, self.commit_idx);
        }
        self.log.append_many(new_entries);

        let new_commit = self.log.last_index().min(leader_commit);
        if new_commit > self.commit_idx {
            self.commit_idx = new_commit;
        }

        let reply = self.envelope(
            msg.src,
            None,
            Body::Ok {
                value: None,
                prev_log_idx: Some(prev_log_idx),
                entries: Some(entries),
            },
        );
        self.transport.send(&reply).await
    }

    /// Leader-side: a follower confirmed replication through `prev_log_idx + len(entries)`.
    /// Meaningful only while still Leader in the term the reply was sent for.
    pub(crate) async fn handle_append_entries_ok(&mut self, msg: Message) -> Result<(), RaftError> {
        if !self.is_leader() || msg.term != self.current_term {
            return Ok(());
        }
        let (prev_log_idx, entries) = match &msg.body {
            Body::Ok {
                prev_log_idx: Some(p),
                entries: Some(e),
                ..
            } => (*p, e.len() as u64),
            _ => return Ok(()),
        };

        let new_match = prev_log_idx + entries;
        let current_match = *self.match_idx.get(&msg.src).unwrap_or(&0);
        if new_match > current_match {
            self.match_idx.insert(msg.src, new_match);
            self.next_idx.insert(msg.src, new_match + 1);
            self.recompute_commit_index();
        }
        Ok(())
    }

    /// Leader-side: a follower rejected an AppendEntries. Back up `next_idx` using the conflict
    /// hint if one was given, else by one, and retry immediately rather than waiting for the next
    /// throttled catch-up send.
    pub(crate) async fn handle_append_entries_fail(&mut self, msg: Message) -> Result<(), RaftError> {
        if !self.is_leader() || msg.term != self.current_term {
            return Ok(());
        }
        let term_first_idx = match &msg.body {
            Body::Fail { term_first_idx } => *term_first_idx,
            _ => return Ok(()),
        };

        let match_idx = *self.match_idx.get(&msg.src).unwrap_or(&0);
        let next = match term_first_idx {
            Some(hint) => hint.max(match_idx).max(1),
            None => {
                let current_next = *self.next_idx.get(&msg.src).unwrap_or(&1);
                current_next.saturating_sub(1).max(1)
            }
        };
        self.next_idx.insert(msg.src, next);
        self.send_append_entries_to(msg.src, Instant::now()).await
    }

    /// The highest index replicated on a majority (including self), recomputed after every
    /// `match_idx` update. Only ever commits a current-term entry by counting; earlier-term
    /// entries are committed indirectly once a current-term entry commits over them.
    fn recompute_commit_index(&mut self) {
        let quorum = self.config.quorum();
        let mut matches: Vec<u64> = self
            .config
            .peers
            .iter()
            .map(|p| *self.match_idx.get(p).unwrap_or(&0))
            .collect();
        matches.push(self.log.last_index());
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matches[quorum - 1];
        if candidate > self.commit_idx && self.log.entry(candidate).map(|e| e.term) == Some(self.current_term) {
            self.commit_idx = candidate;
            info!("[{}] commit index advanced to {candidate}", self.config.self_id);
        }
    }
}
