use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::error::RaftError;
use crate::id::ReplicaId;
use crate::log::{Log, LogCommand};
use crate::message::{Body, Message};
use crate::state_machine::StateMachine;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Follower,
    Candidate,
    Leader,
}

/// An outstanding `get` waiting for the leader to confirm, via commit, that it is still the
/// leader before answering.
pub(crate) struct PendingRead {
    pub(crate) commit_idx_at_receipt: u64,
    pub(crate) request: Message,
    pub(crate) received_at: Instant,
}

/// Client requests buffered while this replica is not (or doesn't yet know) the leader.
/// Insertion-ordered so a bulk flush services requests in arrival order; deduplicated by MID so a
/// retransmitted request doesn't queue twice.
#[derive(Default)]
pub(crate) struct BufferedClients {
    order: Vec<String>,
    by_mid: HashMap<String, Message>,
}

impl BufferedClients {
    pub(crate) fn insert(&mut self, mid: String, msg: Message) {
        if !self.by_mid.contains_key(&mid) {
            self.order.push(mid.clone());
        }
        self.by_mid.insert(mid, msg);
    }

    pub(crate) fn drain(&mut self) -> Vec<Message> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|mid| self.by_mid.remove(&mid))
            .collect()
    }
}

/// A single Raft replica: a single-threaded cooperative event loop over one owned aggregate of
/// mutable state. There is no `Arc<Mutex<_>>` here and no spawned background tasks -- every field
/// is touched only from within `tick()`.
pub struct Replica<T: Transport> {
    pub(crate) config: Config,
    pub(crate) transport: T,
    pub(crate) rng: StdRng,

    // "Persistent-style" fields (in-memory only; this crate does not specify crash recovery).
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) log: Log,

    // Volatile per-replica.
    pub(crate) commit_idx: u64,
    pub(crate) last_applied: u64,
    pub(crate) state: ReplicaState,
    pub(crate) leader: ReplicaId,
    pub(crate) datastore: StateMachine,

    // Volatile leader-only.
    pub(crate) next_idx: HashMap<ReplicaId, u64>,
    pub(crate) match_idx: HashMap<ReplicaId, u64>,
    pub(crate) votes: HashSet<ReplicaId>,
    pub(crate) pending_reads: VecDeque<PendingRead>,
    pub(crate) buffered_client: BufferedClients,

    // Timers. All compared with logical `Instant`s; see `config.rs` for the fixed durations.
    pub(crate) election_deadline: Instant,
    pub(crate) election_timeout: Duration,
    pub(crate) last_heartbeat_sent: Instant,
    pub(crate) last_peer_send: HashMap<ReplicaId, Instant>,
    pub(crate) last_buffer_flush: Instant,
}

impl<T: Transport> Replica<T> {
    pub fn new(config: Config, transport: T) -> Self {
        Self::with_rng(config, transport, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG, so tests can seed it for reproducible election
    /// timeouts.
    pub fn with_rng(config: Config, transport: T, rng: StdRng) -> Self {
        let now = Instant::now();
        let mut replica = Replica {
            config,
            transport,
            rng,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_idx: 0,
            last_applied: 0,
            state: ReplicaState::Follower,
            leader: ReplicaId::BROADCAST,
            datastore: StateMachine::new(),
            next_idx: HashMap::new(),
            match_idx: HashMap::new(),
            votes: HashSet::new(),
            pending_reads: VecDeque::new(),
            buffered_client: BufferedClients::default(),
            election_deadline: now,
            election_timeout: Duration::from_millis(0),
            last_heartbeat_sent: now,
            last_peer_send: HashMap::new(),
            last_buffer_flush: now,
        };
        replica.reset_election_timer(now);
        replica
    }

    pub fn self_id(&self) -> ReplicaId {
        self.config.self_id
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn commit_idx(&self) -> u64 {
        self.commit_idx
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn leader(&self) -> ReplicaId {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.state == ReplicaState::Leader
    }

    /// Build a reply envelope: `src` is us, everything else comes from this replica's current
    /// belief about term/leader plus the caller-supplied destination/MID/body.
    pub(crate) fn envelope(&self, dst: ReplicaId, mid: Option<String>, body: Body) -> Message {
        Message {
            src: self.config.self_id,
            dst,
            leader: self.leader,
            term: self.current_term,
            mid,
            body,
        }
    }

    /// Runs the event loop forever. Intended for the `replica` binary; tests drive `tick()`
    /// directly so they can interleave assertions and control mock transports/timers.
    pub async fn run(&mut self) -> Result<(), RaftError> {
        loop {
            self.tick().await?;
        }
    }

    /// One iteration of the event loop, in the fixed order the design calls for:
    /// manage buffered clients, fail stale reads, leader sends, election check, apply commits,
    /// then block on one inbound message with a timeout.
    pub async fn tick(&mut self) -> Result<(), RaftError> {
        let now = Instant::now();

        self.manage_buffered_clients(now).await?;
        self.fail_stale_pending_reads(now).await?;

        if self.is_leader() {
            self.send_catch_up(now).await?;
            self.send_heartbeat_if_due(now).await?;
        } else {
            self.maybe_start_election(now).await?;
        }

        self.apply_committed().await?;

        match self.transport.recv_timeout(crate::config::RECEIVE_TIMEOUT).await {
            Ok(Some(msg)) => self.dispatch(msg).await?,
            Ok(None) => {}
            Err(e) => debug!("dropping inbound message: {e}"),
        }

        Ok(())
    }

    /// Dispatches one inbound message: a term bump always steps us down to Follower first, then
    /// the message is matched exhaustively over the eight wire kinds. Unknown types can't occur
    /// here (serde would have rejected them on deserialization) -- an unrecognized `type` field
    /// is a malformed message, handled by the transport layer, not a "known but unhandled" case.
    pub(crate) async fn dispatch(&mut self, msg: Message) -> Result<(), RaftError> {
        let now = Instant::now();
        if msg.term > self.current_term {
            self.become_follower(msg.term, Some(msg.leader).filter(|l| !l.is_broadcast()), now)
                .await?;
        }

        match &msg.body {
            Body::Get { .. } => self.handle_client_get(msg, now).await?,
            Body::Put { .. } => self.handle_client_put(msg, now).await?,
            Body::RequestVote { .. } => self.handle_request_vote(msg, now).await?,
            Body::ResponseVote { .. } => self.handle_response_vote(msg, now).await?,
            Body::AppendEntries { .. } => self.handle_append_entries(msg, now).await?,
            Body::Ok { .. } => self.handle_append_entries_ok(msg).await?,
            Body::Fail { .. } => self.handle_append_entries_fail(msg).await?,
            Body::Redirect { .. } => {
                debug!("ignoring unexpected redirect from {}", msg.src);
            }
        }
        Ok(())
    }

    /// Applies every committed-but-unapplied entry to the state machine, in order. If we're the
    /// leader, also answers clients whose `put` just committed in our own term, and any pending
    /// reads whose recorded commit index has now been reached.
    pub(crate) async fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_idx {
            self.last_applied += 1;
            let idx = self.last_applied;
            let entry = self.log.entry(idx).expect("committed entry must exist").clone();
            self.datastore.apply(&entry.command);

            if self.is_leader() && entry.term == self.current_term {
                if let LogCommand::Put { src, mid, .. } = &entry.command {
                    let reply = self.envelope(*src, Some(mid.clone()), Body::Ok {
                        value: None,
                        prev_log_idx: None,
                        entries: None,
                    });
                    self.transport.send(&reply).await?;
                }
            }
        }

        if self.is_leader() {
            let commit_idx = self.commit_idx;
            let ready: Vec<PendingRead> = {
                let mut ready = Vec::new();
                let mut still_pending = VecDeque::new();
                for read in self.pending_reads.drain(..) {
                    if read.commit_idx_at_receipt <= commit_idx {
                        ready.push(read);
                    } else {
                        still_pending.push_back(read);
                    }
                }
                self.pending_reads = still_pending;
                ready
            };
            for read in ready {
                if let Body::Get { key } = &read.request.body {
                    let value = self.datastore.get(key);
                    let reply = self.envelope(
                        read.request.src,
                        read.request.mid.clone(),
                        Body::Ok {
                            value: Some(value),
                            prev_log_idx: None,
                            entries: None,
                        },
                    );
                    self.transport.send(&reply).await?;
                }
            }
        }

        Ok(())
    }

    pub(crate) fn log_transition(&self, what: &str) {
        info!(
            "[{}] {what} (term={}, state={:?}, leader={})",
            self.config.self_id, self.current_term, self.state, self.leader
        );
    }
}
