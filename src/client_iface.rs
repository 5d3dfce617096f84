use std::time::Instant;

use log::debug;

use crate::config::{BUFFERED_CLIENT_FAIL_AFTER, PENDING_READ_STALE_AFTER};
use crate::error::RaftError;
use crate::log::{LogCommand, LogEntry};
use crate::message::{Body, Message};
use crate::replica::{PendingRead, Replica};
use crate::transport::Transport;

impl<T: Transport> Replica<T> {
    /// A `get` on the Leader is gated on commit confirmation rather than answered immediately: we
    /// record the request alongside the commit index seen on receipt, and only answer once a
    /// commit reaches that index (see `apply_committed`). If there is nothing uncommitted to wait
    /// on, append a no-op so the next heartbeat cycle's commit advance confirms leadership.
    pub(crate) async fn handle_client_get(&mut self, msg: Message, now: Instant) -> Result<(), RaftError> {
        if !self.is_leader() {
            self.buffer_client(msg);
            return Ok(());
        }

        if self.commit_idx == self.log.last_index() {
            self.log.append(LogEntry {
                term: self.current_term,
                command: LogCommand::NoOp,
            });
        }
        self.pending_reads.push_back(PendingRead {
            commit_idx_at_receipt: self.commit_idx,
            request: msg,
            received_at: now,
        });
        Ok(())
    }

    /// A `put` on the Leader. Idempotent replay: if a committed entry already carries this MID,
    /// reply immediately with the value it wrote rather than appending a duplicate. Otherwise
    /// append a new entry; the reply is deferred until it commits (see `apply_committed`).
    pub(crate) async fn handle_client_put(&mut self, msg: Message, _now: Instant) -> Result<(), RaftError> {
        if !self.is_leader() {
            self.buffer_client(msg);
            return Ok(());
        }

        let (key, value) = match &msg.body {
            Body::Put { key, value } => (key.clone(), value.clone()),
            _ => unreachable!("handle_client_put called with non-Put body"),
        };
        let mid = msg.mid.clone().unwrap_or_default();

        if let Some(prior_value) = self.find_committed_put_by_mid(&mid) {
            let reply = self.envelope(
                msg.src,
                Some(mid),
                Body::Ok {
                    value: Some(prior_value),
                    prev_log_idx: None,
                    entries: None,
                },
            );
            return self.transport.send(&reply).await;
        }

        self.log.append(LogEntry {
            term: self.current_term,
            command: LogCommand::Put {
                src: msg.src,
                mid,
                key,
                value,
            },
        });
        Ok(())
    }

    /// Scans committed entries, most recent first, for a prior `put` carrying `mid`. Committed
    /// entries are never truncated, so a hit here is permanent for the lifetime of the log.
    fn find_committed_put_by_mid(&self, mid: &str) -> Option<String> {
        (1..=self.commit_idx).rev().find_map(|idx| match &self.log.entry(idx)?.command {
            LogCommand::Put { mid: m, value, .. } if m == mid => Some(value.clone()),
            _ => None,
        })
    }

    /// Buffers a `get`/`put` received while this replica is not (or doesn't yet know) the leader.
    /// Keyed by MID so a retransmission of the same request doesn't queue twice.
    pub(crate) fn buffer_client(&mut self, msg: Message) {
        let mid = msg.mid.clone().unwrap_or_default();
        self.buffered_client.insert(mid, msg);
    }

    /// Each tick: if we're the leader, dispatch every buffered request through the normal path.
    /// Else if we know who the leader is, redirect each to them. Else, once the buffer has gone
    /// unflushed for `BUFFERED_CLIENT_FAIL_AFTER`, fail everything outright -- this keeps clients
    /// from hammering a leaderless cluster mid-election.
    pub(crate) async fn manage_buffered_clients(&mut self, now: Instant) -> Result<(), RaftError> {
        if self.is_leader() {
            for msg in self.buffered_client.drain() {
                match &msg.body {
                    Body::Get { .. } => self.handle_client_get(msg, now).await?,
                    Body::Put { .. } => self.handle_client_put(msg, now).await?,
                    _ => debug!("dropping non-get/put buffered message from {}", msg.src),
                }
            }
            self.last_buffer_flush = now;
            return Ok(());
        }

        if !self.leader.is_broadcast() {
            for msg in self.buffered_client.drain() {
                let reply = self.envelope(msg.src, msg.mid.clone(), Body::Redirect {});
                self.transport.send(&reply).await?;
            }
            self.last_buffer_flush = now;
            return Ok(());
        }

        if now.duration_since(self.last_buffer_flush) >= BUFFERED_CLIENT_FAIL_AFTER {
            for msg in self.buffered_client.drain() {
                let reply = self.envelope(msg.src, msg.mid.clone(), Body::Fail { term_first_idx: None });
                self.transport.send(&reply).await?;
            }
            self.last_buffer_flush = now;
        }
        Ok(())
    }

    /// Each tick: any pending read older than `PENDING_READ_STALE_AFTER` is failed and evicted.
    /// `pending_reads` is insertion-ordered with monotonically increasing receipt times, so the
    /// first non-stale entry means every entry behind it is non-stale too.
    pub(crate) async fn fail_stale_pending_reads(&mut self, now: Instant) -> Result<(), RaftError> {
        while let Some(front) = self.pending_reads.front() {
            if now.duration_since(front.received_at) < PENDING_READ_STALE_AFTER {
                break;
            }
            let stale = self.pending_reads.pop_front().expect("front just checked");
            let reply = self.envelope(
                stale.request.src,
                stale.request.mid.clone(),
                Body::Fail { term_first_idx: None },
            );
            self.transport.send(&reply).await?;
        }
        Ok(())
    }

    /// On leaving the Leader state: fail every uncommitted log entry's originating client, and
    /// every outstanding pending read, then clear the read queue. Committed entries are untouched
    /// -- they're already guaranteed to survive into every future leader's log.
    pub(crate) async fn fail_in_flight_as_leader(&mut self) -> Result<(), RaftError> {
        let last_idx = self.log.last_index();
        for idx in (self.commit_idx + 1)..=last_idx {
            let put_client = match self.log.entry(idx).map(|e| &e.command) {
                Some(LogCommand::Put { src, mid, .. }) => Some((*src, mid.clone())),
                _ => None,
            };
            if let Some((src, mid)) = put_client {
                let reply = self.envelope(src, Some(mid), Body::Fail { term_first_idx: None });
                self.transport.send(&reply).await?;
            }
        }

        let pending = std::mem::take(&mut self.pending_reads);
        for read in pending {
            let reply = self.envelope(
                read.request.src,
                read.request.mid.clone(),
                Body::Fail { term_first_idx: None },
            );
            self.transport.send(&reply).await?;
        }
        Ok(())
    }
}
