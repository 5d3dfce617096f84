use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::SeedableRng;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use raft_kv_store::{Body, Config, Message, RaftError, Replica, ReplicaId, ReplicaState, Transport};

/// An in-memory replacement for the UDP fabric: one FIFO queue per endpoint (replica or
/// simulated client), guarded by a plain `Mutex` since sends/receives never hold it across an
/// await point. Lets tests inject client requests and observe replies without opening sockets.
#[derive(Clone)]
struct Bus {
    queues: Arc<StdMutex<HashMap<ReplicaId, VecDeque<Message>>>>,
    partitioned: Arc<StdMutex<std::collections::HashSet<ReplicaId>>>,
}

impl Bus {
    fn new() -> Self {
        Bus {
            queues: Arc::new(StdMutex::new(HashMap::new())),
            partitioned: Arc::new(StdMutex::new(std::collections::HashSet::new())),
        }
    }

    fn endpoint(&self, id: ReplicaId) -> MockTransport {
        MockTransport { id, bus: self.clone() }
    }

    /// Injects a message as if it arrived over the wire, bypassing partition checks -- used by
    /// tests to play the role of a client.
    fn deliver(&self, msg: Message) {
        self.queues.lock().unwrap().entry(msg.dst).or_default().push_back(msg);
    }

    fn take(&self, id: ReplicaId) -> Option<Message> {
        self.queues.lock().unwrap().get_mut(&id).and_then(|q| q.pop_front())
    }

    fn partition(&self, id: ReplicaId) {
        self.partitioned.lock().unwrap().insert(id);
    }

    fn heal(&self, id: ReplicaId) {
        self.partitioned.lock().unwrap().remove(&id);
    }
}

struct MockTransport {
    id: ReplicaId,
    bus: Bus,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, msg: &Message) -> Result<(), RaftError> {
        let partitioned = self.bus.partitioned.lock().unwrap();
        if partitioned.contains(&self.id) || partitioned.contains(&msg.dst) {
            return Ok(());
        }
        drop(partitioned);
        self.bus.deliver(msg.clone());
        Ok(())
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, RaftError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.bus.take(self.id) {
                return Ok(Some(msg));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

fn id(s: &str) -> ReplicaId {
    s.parse().unwrap()
}

/// Spawns one ticking task per replica id, all sharing `bus`. Returns the shared handles (for
/// inspection) and the join handles (for killing a node to simulate a crash).
fn spawn_cluster(bus: &Bus, ids: &[&str]) -> (Vec<Arc<AsyncMutex<Replica<MockTransport>>>>, Vec<JoinHandle<()>>) {
    let parsed: Vec<ReplicaId> = ids.iter().map(|s| id(s)).collect();
    let mut replicas = Vec::new();
    let mut handles = Vec::new();

    for (i, &self_id) in parsed.iter().enumerate() {
        let peers = parsed.iter().copied().filter(|&p| p != self_id).collect();
        let config = Config::new(self_id, peers);
        let transport = bus.endpoint(self_id);
        let rng = rand::rngs::StdRng::seed_from_u64(i as u64);
        let replica = Arc::new(AsyncMutex::new(Replica::with_rng(config, transport, rng)));
        let handle = {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move {
                loop {
                    let mut r = replica.lock().await;
                    if r.tick().await.is_err() {
                        break;
                    }
                    drop(r);
                }
            })
        };
        replicas.push(replica);
        handles.push(handle);
    }
    (replicas, handles)
}

async fn current_leader(replicas: &[Arc<AsyncMutex<Replica<MockTransport>>>]) -> Option<ReplicaId> {
    for r in replicas {
        let r = r.lock().await;
        if r.state() == ReplicaState::Leader {
            return Some(r.self_id());
        }
    }
    None
}

async fn wait_for_leader(replicas: &[Arc<AsyncMutex<Replica<MockTransport>>>], timeout: Duration) -> ReplicaId {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(leader) = current_leader(replicas).await {
            return leader;
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected in time");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_reply(bus: &Bus, client: ReplicaId, timeout: Duration) -> Message {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(msg) = bus.take(client) {
            return msg;
        }
        assert!(tokio::time::Instant::now() < deadline, "no reply received in time");
        sleep(Duration::from_millis(10)).await;
    }
}

fn put(client: ReplicaId, dst: ReplicaId, mid: &str, key: &str, value: &str) -> Message {
    Message {
        src: client,
        dst,
        leader: ReplicaId::BROADCAST,
        term: 0,
        mid: Some(mid.to_string()),
        body: Body::Put {
            key: key.to_string(),
            value: value.to_string(),
        },
    }
}

fn get(client: ReplicaId, dst: ReplicaId, mid: &str, key: &str) -> Message {
    Message {
        src: client,
        dst,
        leader: ReplicaId::BROADCAST,
        term: 0,
        mid: Some(mid.to_string()),
        body: Body::Get { key: key.to_string() },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_elects_leader_and_serves_put_get() {
    let bus = Bus::new();
    let (replicas, _handles) = spawn_cluster(&bus, &["0001", "0002", "0003"]);
    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let client = id("C001");
    bus.deliver(put(client, leader, "m1", "alpha", "1"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));

    bus.deliver(get(client, leader, "m2", "alpha"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    match reply.body {
        Body::Ok { value, .. } => assert_eq!(value.as_deref(), Some("1")),
        other => panic!("expected ok, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_crash_elects_new_leader_without_losing_committed_writes() {
    let bus = Bus::new();
    let (replicas, handles) = spawn_cluster(&bus, &["0001", "0002", "0003", "0004", "0005"]);
    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let client = id("C001");
    bus.deliver(put(client, leader, "m1", "beta", "42"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));

    for (i, r) in replicas.iter().enumerate() {
        if r.lock().await.self_id() == leader {
            handles[i].abort();
            break;
        }
    }

    let new_leader = wait_for_leader(&replicas, Duration::from_secs(3)).await;
    assert_ne!(new_leader, leader);

    bus.deliver(get(client, new_leader, "m2", "beta"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    match reply.body {
        Body::Ok { value, .. } => assert_eq!(value.as_deref(), Some("42")),
        other => panic!("expected ok, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_redirects_client_to_leader() {
    let bus = Bus::new();
    let (replicas, _handles) = spawn_cluster(&bus, &["0001", "0002", "0003"]);
    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;
    let follower = id(["0001", "0002", "0003"].iter().find(|&&s| id(s) != leader).unwrap());

    let client = id("C001");
    bus.deliver(put(client, follower, "m1", "gamma", "7"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    let redirected_to = match reply.body {
        Body::Redirect {} => reply.leader,
        other => panic!("expected redirect, got {other:?}"),
    };
    assert_eq!(redirected_to, leader);

    bus.deliver(put(client, redirected_to, "m1", "gamma", "7"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_during_leaderless_window_fails_then_succeeds() {
    let bus = Bus::new();
    let (replicas, _handles) = spawn_cluster(&bus, &["0001", "0002", "0003"]);

    let client = id("C001");
    // Sent immediately: with no leader known yet, this lands on whichever replica is still
    // a follower/candidate and gets buffered until it times out.
    bus.deliver(put(client, id("0001"), "m1", "delta", "9"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(2)).await;
    assert!(
        matches!(reply.body, Body::Fail { .. }) || matches!(reply.body, Body::Ok { .. }),
        "expected fail (buffered out) or ok (served once elected)"
    );

    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;
    bus.deliver(put(client, leader, "m2", "delta", "9"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_follower_catches_up_after_heal() {
    let bus = Bus::new();
    let (replicas, _handles) = spawn_cluster(&bus, &["0001", "0002", "0003"]);
    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;
    let isolated = id(["0001", "0002", "0003"].iter().find(|&&s| id(s) != leader).unwrap());

    bus.partition(isolated);

    let client = id("C001");
    for i in 0..5 {
        bus.deliver(put(client, leader, &format!("m{i}"), "epsilon", &i.to_string()));
        let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
        assert!(matches!(reply.body, Body::Ok { .. }));
    }

    let leader_replica = {
        let mut found = None;
        for r in &replicas {
            if r.lock().await.self_id() == leader {
                found = Some(Arc::clone(r));
            }
        }
        found.unwrap()
    };
    let leader_last_index = leader_replica.lock().await.last_log_index();

    bus.heal(isolated);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let isolated_replica = {
            let mut found = None;
            for r in &replicas {
                if r.lock().await.self_id() == isolated {
                    found = Some(Arc::clone(r));
                }
            }
            found.unwrap()
        };
        let caught_up = isolated_replica.lock().await.last_log_index() >= leader_last_index;
        if caught_up {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "follower never caught up after heal");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_mid_is_applied_at_most_once() {
    let bus = Bus::new();
    let (replicas, _handles) = spawn_cluster(&bus, &["0001", "0002", "0003"]);
    let leader = wait_for_leader(&replicas, Duration::from_secs(2)).await;

    let client = id("C001");
    bus.deliver(put(client, leader, "dup-1", "zeta", "7"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));

    let leader_replica = {
        let mut found = None;
        for r in &replicas {
            if r.lock().await.self_id() == leader {
                found = Some(Arc::clone(r));
            }
        }
        found.unwrap()
    };
    let index_after_first = leader_replica.lock().await.last_log_index();

    bus.deliver(put(client, leader, "dup-1", "zeta", "7"));
    let reply = wait_for_reply(&bus, client, Duration::from_secs(1)).await;
    assert!(matches!(reply.body, Body::Ok { .. }));

    let index_after_second = leader_replica.lock().await.last_log_index();
    assert_eq!(
        index_after_first, index_after_second,
        "a replayed MID must not append a second log entry"
    );
}

