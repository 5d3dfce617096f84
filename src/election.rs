use std::time::Instant;

use log::info;
use rand::Rng;

use crate::config::{ELECTION_TIMEOUT_KNOWN_LEADER, ELECTION_TIMEOUT_LEADERLESS};
use crate::error::RaftError;
use crate::id::ReplicaId;
use crate::message::{Body, Message};
use crate::replica::{Replica, ReplicaState};
use crate::transport::Transport;

impl<T: Transport> Replica<T> {
    /// Uniform in [50, 100] ms while no leader is known (converge quickly), [250, 400] ms once
    /// one is (avoid false-positive elections against a healthy leader).
    fn compute_election_timeout(&mut self) -> std::time::Duration {
        let (lo, hi) = if self.leader.is_broadcast() {
            ELECTION_TIMEOUT_LEADERLESS
        } else {
            ELECTION_TIMEOUT_KNOWN_LEADER
        };
        self.rng.gen_range(lo..=hi)
    }

    /// Resets on: AppendEntries acceptance from the current leader, granting a vote, and
    /// transitioning to Candidate.
    pub(crate) fn reset_election_timer(&mut self, now: Instant) {
        self.election_timeout = self.compute_election_timeout();
        self.election_deadline = now + self.election_timeout;
    }

    /// Step 5 of the event loop: if we're not the leader and the election timeout has elapsed,
    /// become a Candidate and broadcast RequestVote.
    pub(crate) async fn maybe_start_election(&mut self, now: Instant) -> Result<(), RaftError> {
        if self.state == ReplicaState::Leader {
            return Ok(());
        }
        if now < self.election_deadline {
            return Ok(());
        }
        self.become_candidate(now);
        self.broadcast_request_vote().await
    }

    fn become_candidate(&mut self, now: Instant) {
        self.current_term += 1;
        self.voted_for = Some(self.config.self_id);
        self.votes.clear();
        self.votes.insert(self.config.self_id);
        self.leader = ReplicaId::BROADCAST;
        self.state = ReplicaState::Candidate;
        self.reset_election_timer(now);
        self.log_transition("became candidate");
    }

    async fn broadcast_request_vote(&mut self) -> Result<(), RaftError> {
        let last_log_idx = self.log.last_index();
        let last_log_term = self.log.last_term();
        let peers = self.config.peers.clone();
        for peer in peers {
            let msg = self.envelope(
                peer,
                None,
                Body::RequestVote {
                    last_log_idx,
                    last_log_term,
                },
            );
            self.transport.send(&msg).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_request_vote(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<(), RaftError> {
        let (last_log_idx, last_log_term) = match &msg.body {
            Body::RequestVote {
                last_log_idx,
                last_log_term,
            } => (*last_log_idx, *last_log_term),
            _ => unreachable!("handle_request_vote called with non-RequestVote body"),
        };

        let mut vote_granted = false;
        let can_vote_for_candidate = self.voted_for.is_none() || self.voted_for == Some(msg.src);
        if msg.term >= self.current_term && can_vote_for_candidate {
            let candidate_is_up_to_date = last_log_term > self.log.last_term()
                || (last_log_term == self.log.last_term() && last_log_idx >= self.log.last_index());
            if candidate_is_up_to_date {
                self.voted_for = Some(msg.src);
                self.reset_election_timer(now);
                vote_granted = true;
                info!(
                    "[{}] granted vote to {} for term {}",
                    self.config.self_id, msg.src, msg.term
                );
            }
        }

        let reply = self.envelope(msg.src, None, Body::ResponseVote { value: vote_granted });
        self.transport.send(&reply).await
    }

    pub(crate) async fn handle_response_vote(
        &mut self,
        msg: Message,
        now: Instant,
    ) -> Result<(), RaftError> {
        let granted = match msg.body {
            Body::ResponseVote { value } => value,
            _ => unreachable!("handle_response_vote called with non-ResponseVote body"),
        };

        if self.state != ReplicaState::Candidate || msg.term != self.current_term || !granted {
            return Ok(());
        }

        self.votes.insert(msg.src);
        if self.votes.len() >= self.config.quorum() {
            self.become_leader(now).await?;
        }
        Ok(())
    }

    async fn become_leader(&mut self, now: Instant) -> Result<(), RaftError> {
        self.state = ReplicaState::Leader;
        self.leader = self.config.self_id;
        let next_idx_init = self.commit_idx + 1;
        self.next_idx.clear();
        self.match_idx.clear();
        for &peer in &self.config.peers {
            self.next_idx.insert(peer, next_idx_init);
            self.match_idx.insert(peer, 0);
            self.last_peer_send.insert(peer, now);
        }
        self.last_heartbeat_sent = now;
        self.log_transition("became leader");
        self.broadcast_heartbeat(now).await
    }

    /// The "Any -> Follower" transition. Called both when a message carries a higher term (from
    /// `dispatch`, for every message kind) and when a valid AppendEntries arrives at
    /// `term == current_term` (from the replication module, e.g. a Candidate learning someone
    /// else already won this term's election). `voted_for` is only reset when the term actually
    /// increases, per invariant 4; a same-term AppendEntries must not erase a valid vote record.
    /// Fails every in-flight client obligation if we were the leader.
    pub(crate) async fn become_follower(
        &mut self,
        new_term: u64,
        leader_hint: Option<ReplicaId>,
        now: Instant,
    ) -> Result<(), RaftError> {
        let was_leader = self.state == ReplicaState::Leader;
        let term_increased = new_term > self.current_term;
        let state_changed = self.state != ReplicaState::Follower;

        if was_leader {
            self.fail_in_flight_as_leader().await?;
        }
        self.current_term = new_term;
        if term_increased {
            self.voted_for = None;
        }
        self.state = ReplicaState::Follower;
        if let Some(leader) = leader_hint {
            self.leader = leader;
        } else if term_increased {
            self.leader = ReplicaId::BROADCAST;
        }
        self.reset_election_timer(now);
        if state_changed || term_increased {
            self.log_transition("stepped down to follower");
        }
        Ok(())
    }
}
