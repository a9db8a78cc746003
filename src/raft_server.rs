//! Consensus integration
//!
//! Wraps a raft-rs `RawNode` in a driver thread that multiplexes the 100 ms
//! tick, proposals, peer messages and membership changes over one channel,
//! and processes the Ready/LightReady cycle. Every committed normal entry
//! decodes to a change-set and goes through the server's apply funnel with
//! the WAL enabled, so the log is written on every node at commit time, not
//! at propose time.
//!
//! Peer transport is the in-memory `NodeRegistry`: node id to driver
//! channel, shared explicitly by the nodes of a cluster. It models
//! membership; a real deployment would put an RPC transport behind the same
//! registry surface.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, EntryType, Message, Snapshot};
use raft::storage::MemStorage;
use raft::{Config as RaftConfig, RawNode};

use crate::changeset::ChangeSet;
use crate::error::{BasaltError, Result};
use crate::server::{Server, ServerShared};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const PROPOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// In-memory message transport and membership registry: node id → driver
/// channel of that node's `RaftServer`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<u64, mpsc::Sender<RaftInput>>>,
}

impl NodeRegistry {
    pub fn new() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::default())
    }

    fn register(&self, id: u64, sender: mpsc::Sender<RaftInput>) {
        self.nodes
            .lock()
            .expect("registry lock poisoned")
            .insert(id, sender);
    }

    fn sender(&self, id: u64) -> Option<mpsc::Sender<RaftInput>> {
        self.nodes
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }
}

pub(crate) enum RaftInput {
    Propose {
        data: Vec<u8>,
        reply: mpsc::SyncSender<Result<()>>,
    },
    Step(Box<Message>),
    ConfChange(ConfChange),
}

/// Handle held by the server: turns `submit_change_set` into a proposal.
pub(crate) struct RaftHandle {
    sender: Mutex<mpsc::Sender<RaftInput>>,
}

impl RaftHandle {
    pub(crate) fn propose(&self, cs: &ChangeSet) -> Result<()> {
        let data = cs.to_bytes()?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.sender
            .lock()
            .expect("raft handle lock poisoned")
            .send(RaftInput::Propose {
                data,
                reply: reply_tx,
            })
            .map_err(|_| BasaltError::Replication("consensus driver stopped".into()))?;

        match reply_rx.recv_timeout(PROPOSE_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(BasaltError::Replication("propose timed out".into())),
        }
    }
}

pub struct RaftServer {
    id: u64,
    registry: Arc<NodeRegistry>,
}

impl RaftServer {
    /// Start a bootstrap node: sole voter of a fresh cluster; campaigns
    /// immediately so proposals are accepted right away.
    pub fn start(server: &Server, id: u64, registry: &Arc<NodeRegistry>) -> RaftServer {
        Self::launch(server, id, registry, true)
    }

    /// Start a blank node that joins an existing cluster once a member
    /// proposes its AddNode conf-change (see `ask_join`).
    pub fn start_joining(server: &Server, id: u64, registry: &Arc<NodeRegistry>) -> RaftServer {
        Self::launch(server, id, registry, false)
    }

    fn launch(
        server: &Server,
        id: u64,
        registry: &Arc<NodeRegistry>,
        bootstrap: bool,
    ) -> RaftServer {
        let (tx, rx) = mpsc::channel();
        registry.register(id, tx.clone());

        let shared = Arc::clone(server.shared());
        *shared.raft.write().expect("raft lock poisoned") = Some(RaftHandle {
            sender: Mutex::new(tx.clone()),
        });

        let registry_for_driver = Arc::clone(registry);
        thread::spawn(move || drive(id, bootstrap, shared, registry_for_driver, rx));

        RaftServer {
            id,
            registry: Arc::clone(registry),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the member `target` to propose adding this node.
    pub fn ask_join(&self, target: u64) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.set_node_id(self.id);

        let sender = self.registry.sender(target).ok_or_else(|| {
            BasaltError::Replication(format!("unknown node for join: {}", target))
        })?;
        sender
            .send(RaftInput::ConfChange(cc))
            .map_err(|_| BasaltError::Replication("consensus driver stopped".into()))
    }
}

fn drive(
    id: u64,
    bootstrap: bool,
    shared: Arc<ServerShared>,
    registry: Arc<NodeRegistry>,
    rx: mpsc::Receiver<RaftInput>,
) {
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let config = RaftConfig {
        id,
        election_tick: 10,
        heartbeat_tick: 1,
        max_size_per_msg: 4096,
        max_inflight_msgs: 256,
        ..Default::default()
    };

    let storage = if bootstrap {
        MemStorage::new_with_conf_state(ConfState::from((vec![id], vec![])))
    } else {
        MemStorage::new()
    };

    let mut node = match RawNode::new(&config, storage, &logger) {
        Ok(node) => node,
        Err(e) => {
            log::error!("raft[{}] failed to start: {}", id, e);
            return;
        }
    };

    if bootstrap {
        if let Err(e) = node.campaign() {
            log::error!("raft[{}] campaign failed: {}", id, e);
        }
    }

    let mut last_tick = Instant::now();
    loop {
        let timeout = TICK_INTERVAL
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::from_millis(1));
        match rx.recv_timeout(timeout) {
            Ok(RaftInput::Propose { data, reply }) => {
                let result = node
                    .propose(vec![], data)
                    .map_err(|e| BasaltError::Replication(format!("propose rejected: {}", e)));
                let _ = reply.send(result);
            }
            Ok(RaftInput::Step(msg)) => {
                if let Err(e) = node.step(*msg) {
                    log::error!("raft[{}] step failed: {}", id, e);
                }
            }
            Ok(RaftInput::ConfChange(cc)) => {
                log::info!("raft[{}] proposing conf change: add node {}", id, cc.get_node_id());
                if let Err(e) = node.propose_conf_change(vec![], cc) {
                    log::error!("raft[{}] conf change rejected: {}", id, e);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("raft[{}] driver shutting down", id);
                return;
            }
        }

        if last_tick.elapsed() >= TICK_INTERVAL {
            node.tick();
            last_tick = Instant::now();
        }

        on_ready(id, &mut node, &shared, &registry);
    }
}

fn on_ready(
    id: u64,
    node: &mut RawNode<MemStorage>,
    shared: &Arc<ServerShared>,
    registry: &Arc<NodeRegistry>,
) {
    if !node.has_ready() {
        return;
    }

    let store = node.raft.raft_log.store.clone();
    let mut ready = node.ready();

    if !ready.messages().is_empty() {
        send_messages(id, registry, ready.take_messages());
    }

    if *ready.snapshot() != Snapshot::default() {
        if let Err(e) = store.wl().apply_snapshot(ready.snapshot().clone()) {
            log::error!("raft[{}] snapshot apply failed: {}", id, e);
        }
    }

    handle_committed_entries(id, node, shared, ready.take_committed_entries());

    if !ready.entries().is_empty() {
        store
            .wl()
            .append(ready.entries())
            .expect("raft log append failed");
    }

    if let Some(hs) = ready.hs() {
        store.wl().set_hardstate(hs.clone());
    }

    if !ready.persisted_messages().is_empty() {
        send_messages(id, registry, ready.take_persisted_messages());
    }

    let mut light_rd = node.advance(ready);

    if let Some(commit) = light_rd.commit_index() {
        store.wl().mut_hard_state().set_commit(commit);
    }
    send_messages(id, registry, light_rd.take_messages());
    handle_committed_entries(id, node, shared, light_rd.take_committed_entries());

    node.advance_apply();
}

fn handle_committed_entries(
    id: u64,
    node: &mut RawNode<MemStorage>,
    shared: &Arc<ServerShared>,
    entries: Vec<raft::eraftpb::Entry>,
) {
    for entry in entries {
        if entry.data.is_empty() {
            // raft appends an empty entry when a leader takes office
            continue;
        }

        match entry.get_entry_type() {
            EntryType::EntryConfChange => {
                let mut cc = ConfChange::default();
                cc.merge_from_bytes(&entry.data)
                    .expect("malformed conf change entry");
                let conf_state = node
                    .apply_conf_change(&cc)
                    .expect("conf change apply failed");
                node.raft.raft_log.store.wl().set_conf_state(conf_state);
                log::info!("raft[{}] applied conf change: add node {}", id, cc.get_node_id());
            }
            EntryType::EntryNormal => {
                let cs = ChangeSet::from_bytes(&entry.data)
                    .expect("malformed change-set in committed entry");
                log::debug!("raft[{}] applying committed {}", id, cs.kind());
                // a failure here means this node diverged from the
                // replicated history; it must not keep serving
                if let Err(e) = shared.apply_change_set(cs, true, None) {
                    panic!("raft[{}] replicated apply failed: {}", id, e);
                }
            }
            _ => {
                log::warn!("raft[{}] unhandled entry type: {:?}", id, entry.get_entry_type());
            }
        }
    }
}

fn send_messages(id: u64, registry: &Arc<NodeRegistry>, messages: Vec<Message>) {
    for msg in messages {
        let to = msg.to;
        match registry.sender(to) {
            Some(sender) => {
                if sender.send(RaftInput::Step(Box::new(msg))).is_err() {
                    log::warn!("raft[{}] peer {} stopped", id, to);
                }
            }
            None => log::warn!("raft[{}] no transport for peer {}", id, to),
        }
    }
}
