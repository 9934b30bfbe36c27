use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use tokio::sync::mpsc;

pub use ferry_core::config::ExecutorSettings;
pub use ferry_core::wire::{
    CommitAbortReason, CommitId, CommitMode, MigrationMetadata, ObjectState, ResidentHint,
};
pub use ferry_core::{
    Envelope, MigrationContext, MigrationIntent, MigrationSide, ObjectId, PeerMessage, RecvType,
    SendType, ServerId, TransactionId, WorkPriority,
};
pub use ferry_services::{
    work, Abort, DatabasePeer, EngineError, InboundSource, KindInfo, KindRegistry, KindTag,
    Object, PeerSender, Server, SnapshotStore, UnitState, Value,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const A: ServerId = ServerId::new(1);
pub const B: ServerId = ServerId::new(2);
pub const C: ServerId = ServerId::new(3);
/// Never part of a fleet; anything sent to it is dropped.
pub const OUTSIDER: ServerId = ServerId::new(4);

pub const SHIP: KindTag = KindTag(1);

fn ship_defaults() -> BTreeMap<String, Value> {
    [("hp".to_string(), Value::Int(100))].into_iter().collect()
}

fn ship_migrated(ship: &mut Object, ctx: &MigrationContext) {
    let how = match ctx.side {
        MigrationSide::Send => ctx.send_type().to_string(),
        MigrationSide::Receive => ctx.recv_type().to_string(),
    };
    ship.set("last_migration", how);
}

/// Kinds every test server registers.
pub fn kinds() -> KindRegistry {
    let mut kinds = KindRegistry::new();
    kinds.register(KindInfo {
        tag: SHIP,
        name: "ship",
        defaults: ship_defaults,
        post_migrate: Some(ship_migrated),
    });
    kinds
}

/// Servers plus a router that delivers only when told to.
///
/// Everything a server sends lands on one shared channel. `route` moves it
/// into per-server inboxes; `deliver` and `step` let a test decide who
/// sees what, and when.
pub struct Fleet {
    servers: BTreeMap<ServerId, Server>,
    inboxes: BTreeMap<ServerId, VecDeque<Envelope>>,
    database: Option<(DatabasePeer, VecDeque<Envelope>)>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    partitioned: BTreeSet<ServerId>,
    /// Every envelope routed so far, in order.
    pub log: Vec<Envelope>,
    pub dropped: Vec<Envelope>,
}

impl Fleet {
    pub fn new(ids: &[ServerId]) -> Self {
        Self::with_settings(ids, ExecutorSettings::default())
    }

    pub fn with_settings(ids: &[ServerId], settings: ExecutorSettings) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let mut fleet = Self {
            servers: BTreeMap::new(),
            inboxes: BTreeMap::new(),
            database: None,
            outbound,
            tx,
            partitioned: BTreeSet::new(),
            log: Vec::new(),
            dropped: Vec::new(),
        };
        for &id in ids {
            fleet.servers.insert(
                id,
                Server::new(id, kinds(), PeerSender::new(id, fleet.tx.clone()), &settings),
            );
            fleet.inboxes.insert(id, VecDeque::new());
        }
        fleet
    }

    /// Attach a Database peer backed by `store`.
    pub fn with_database(mut self, store: SnapshotStore) -> Self {
        let peer = DatabasePeer::new(store, PeerSender::new(ServerId::DATABASE, self.tx.clone()));
        self.database = Some((peer, VecDeque::new()));
        self
    }

    pub fn server(&self, id: ServerId) -> &Server {
        &self.servers[&id]
    }

    pub fn server_mut(&mut self, id: ServerId) -> &mut Server {
        self.servers.get_mut(&id).expect("server in fleet")
    }

    pub fn database(&self) -> Option<&DatabasePeer> {
        self.database.as_ref().map(|(peer, _)| peer)
    }

    /// Drop everything addressed to `id` from now on.
    pub fn partition(&mut self, id: ServerId) {
        self.partitioned.insert(id);
    }

    /// Move everything sent so far into inboxes. Returns how many
    /// envelopes were delivered to an inbox.
    pub fn route(&mut self) -> usize {
        let mut routed = 0;
        for envelope in self.outbound.pump() {
            self.log.push(envelope.clone());
            if self.partitioned.contains(&envelope.to) {
                self.dropped.push(envelope);
                continue;
            }
            let inbox = match (&mut self.database, self.inboxes.get_mut(&envelope.to)) {
                (_, Some(inbox)) => inbox,
                (Some((_, inbox)), None) if envelope.to == ServerId::DATABASE => inbox,
                _ => {
                    self.dropped.push(envelope);
                    continue;
                }
            };
            inbox.push_back(envelope);
            routed += 1;
        }
        routed
    }

    /// Put an envelope straight into its recipient's inbox.
    pub fn inject(&mut self, envelope: Envelope) {
        if let Some(inbox) = self.inboxes.get_mut(&envelope.to) {
            inbox.push_back(envelope);
        } else if let Some((_, inbox)) = self.database.as_mut().filter(|_| envelope.to == ServerId::DATABASE) {
            inbox.push_back(envelope);
        }
    }

    /// Let `id` handle its inbox without ticking or executing.
    pub fn deliver(&mut self, id: ServerId) -> Result<usize, EngineError> {
        let (Some(server), Some(inbox)) = (self.servers.get_mut(&id), self.inboxes.get_mut(&id)) else {
            return Ok(0);
        };
        server.pump(inbox)
    }

    pub fn step(&mut self, id: ServerId) -> Result<bool, EngineError> {
        let (Some(server), Some(inbox)) = (self.servers.get_mut(&id), self.inboxes.get_mut(&id)) else {
            return Ok(false);
        };
        server.step(inbox)
    }

    /// Route and step every member until a whole round changes nothing.
    /// Returns the number of rounds it took.
    pub fn run_until_quiet(&mut self, max_rounds: usize) -> Result<usize> {
        let ids: Vec<ServerId> = self.servers.keys().copied().collect();
        for round in 0..max_rounds {
            let mut progressed = self.route() > 0;
            for &id in &ids {
                progressed |= self.step(id)?;
            }
            if let Some((peer, inbox)) = &mut self.database {
                progressed |= peer.pump(inbox)? > 0;
            }
            if !progressed {
                return Ok(round);
            }
        }
        bail!("fleet still busy after {max_rounds} rounds")
    }

    /// Number of members that consider `object` theirs.
    pub fn owners_of(&self, object: ObjectId) -> Vec<ServerId> {
        self.servers
            .iter()
            .filter(|(_, s)| s.world().registry.is_owned_locally(object))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Routed envelopes whose message matches `kind`.
    pub fn sent(&self, kind: &str) -> Vec<&Envelope> {
        self.log.iter().filter(|e| e.message.kind() == kind).collect()
    }
}

pub fn request(from: ServerId, to: ServerId, object: ObjectId, priority: u64, intent: MigrationIntent) -> Envelope {
    Envelope {
        from,
        to,
        message: PeerMessage::RequestObject {
            object,
            requester: from,
            priority: WorkPriority::from_raw(priority),
            intent,
            last_known_resident: to,
        },
    }
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(label: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("ferry-it-{label}-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
