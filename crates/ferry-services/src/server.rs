//! Server context: one peer's world, work queue and protocol state.
//!
//! There are no globals. A `Server` owns its object world, executor,
//! transfer queue and commit coordinator, and is driven by whoever holds
//! it: the daemon's tick task or a test fleet. Each `step` pumps inbound
//! messages, runs one arbitration tick and one execution pass.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use ferry_core::config::ExecutorSettings;
use ferry_core::wire::{CommitId, CommitMode, MigrationIntent};
use ferry_core::{
    Envelope, MigrationContext, ObjectId, PeerMessage, ServerId, TransactionId, WorkPriority,
};
use serde::Serialize;

use crate::channel::{InboundSource, PeerSender};
use crate::commit::{Begun, CommitCoordinator, CommitOutcome, CommitRole, CommitStats};
use crate::executor::{Executor, ExecutorStats, UnitState};
use crate::object::{KindRegistry, KindTag};
use crate::serializer::{self, SerializationError};
use crate::transfer::{self, Departure, TransferQueue};
use crate::txn::{work, Abort, AttemptOutcome, Txn, WorkFn};
use crate::world::World;

/// Recent migration contexts kept for status and tests.
const MIGRATION_HISTORY: usize = 64;

/// Builds a work closure from invocation arguments.
pub type RemoteFunction = Box<dyn Fn(serde_json::Value) -> WorkFn + Send + Sync>;

pub struct Server {
    world: World,
    executor: Executor,
    transfers: TransferQueue,
    commits: CommitCoordinator,
    sender: PeerSender,
    functions: HashMap<String, RemoteFunction>,
    /// Dependency requests in flight, by object.
    fetching: BTreeMap<ObjectId, Instant>,
    fetch_retry: Duration,
    migrations: VecDeque<MigrationContext>,
}

impl Server {
    pub fn new(local: ServerId, kinds: KindRegistry, sender: PeerSender, settings: &ExecutorSettings) -> Self {
        Self {
            world: World::new(local, kinds),
            executor: Executor::new(local, settings.livelock_report_interval),
            transfers: TransferQueue::new(),
            commits: CommitCoordinator::new(local, settings.commit_timeout()),
            sender,
            functions: HashMap::new(),
            fetching: BTreeMap::new(),
            fetch_retry: settings.commit_timeout(),
            migrations: VecDeque::new(),
        }
    }

    pub fn local(&self) -> ServerId {
        self.world.local
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn commits(&self) -> &CommitCoordinator {
        &self.commits
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfers
    }

    /// Most recent migrations, oldest first.
    pub fn recent_migrations(&self) -> impl Iterator<Item = &MigrationContext> {
        self.migrations.iter()
    }

    /// Create an object outside any work unit.
    pub fn spawn(&mut self, kind: KindTag, name: &str, outer: Option<ObjectId>) -> Option<ObjectId> {
        self.world.spawn(kind, name, outer, false)
    }

    // ── Work ──────────────────────────────────────────────────────────────────

    pub fn enqueue<F>(&mut self, name: impl Into<String>, is_transactional: bool, closure: F) -> TransactionId
    where
        F: FnMut(&mut Txn<'_>) -> Result<(), Abort> + Send + 'static,
    {
        self.executor.enqueue(name, None, is_transactional, work(closure))
    }

    pub fn enqueue_with_priority(
        &mut self,
        name: impl Into<String>,
        priority: WorkPriority,
        is_transactional: bool,
        closure: WorkFn,
    ) -> TransactionId {
        self.executor.enqueue(name, Some(priority), is_transactional, closure)
    }

    /// Make `name` callable by peers through `Invoke`.
    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(serde_json::Value) -> WorkFn + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
    }

    // ── Driving ───────────────────────────────────────────────────────────────

    /// Handle everything that has arrived. Returns the number of envelopes.
    pub fn pump(&mut self, inbound: &mut impl InboundSource) -> Result<usize, EngineError> {
        let envelopes = inbound.pump();
        let count = envelopes.len();
        for envelope in envelopes {
            self.handle_message(envelope)?;
        }
        Ok(count)
    }

    /// Pump, tick, execute. Returns true if anything happened.
    pub fn step(&mut self, inbound: &mut impl InboundSource) -> Result<bool, EngineError> {
        let handled = self.pump(inbound)?;
        let departed = self.tick();
        let ran = self.execute_pass();
        Ok(handled > 0 || departed > 0 || ran > 0)
    }

    /// Step until the queue drains or nothing moves.
    pub fn run_pending(&mut self, inbound: &mut impl InboundSource) -> Result<(), EngineError> {
        while !self.executor.is_empty() {
            if !self.step(inbound)? {
                break;
            }
        }
        Ok(())
    }

    /// Arbitrate parked requests and expire overdue commits. Returns the
    /// number of closures sent away.
    pub fn tick(&mut self) -> usize {
        let departures = self
            .transfers
            .arbitrate(&mut self.world, &self.executor, &self.sender);
        let count = departures.len();
        for departure in departures {
            self.departed(departure);
        }
        if let Some(outcome) = self.commits.expire(Instant::now(), &self.sender) {
            self.settle_commit(outcome);
        }
        count
    }

    /// One attempt for each queued unit, in enqueue order.
    ///
    /// Nothing runs while a commit is in flight, whichever side we are on.
    pub fn execute_pass(&mut self) -> usize {
        let mut ran = 0;
        for transaction in self.executor.queued() {
            if self.commits.is_active() {
                break;
            }
            if self.is_waiting_on_fetch(transaction) {
                continue;
            }
            let Some((result, outcome)) = self
                .executor
                .attempt(transaction, &mut self.world, &self.sender)
            else {
                continue;
            };
            ran += 1;
            self.settle_attempt(transaction, result, outcome);
        }
        ran
    }

    fn settle_attempt(&mut self, transaction: TransactionId, result: Result<(), Abort>, outcome: AttemptOutcome) {
        let Some(unit) = self.executor.unit(transaction) else {
            return;
        };
        let (priority, attempts, transactional) = (unit.priority, unit.execution_attempts, unit.is_transactional);

        if !transactional {
            // Runs once; whatever it wrote stands.
            outcome.journal.apply(&mut self.world);
            match result {
                Ok(()) => {
                    self.executor.complete(transaction);
                }
                Err(abort) => {
                    self.executor.abandon(transaction, &abort.to_string());
                }
            }
            return;
        }

        match result {
            Ok(()) => match outcome.commit {
                None => {
                    outcome.journal.apply(&mut self.world);
                    self.executor.complete(transaction);
                }
                Some(requirement) => {
                    self.executor.await_commit(transaction, &requirement.reason);
                    let begun = self.commits.begin(
                        transaction,
                        attempts,
                        priority,
                        requirement,
                        outcome.journal,
                        &self.world.registry,
                        &self.sender,
                    );
                    if let Begun::NoParticipants(journal) = begun {
                        journal.apply(&mut self.world);
                        self.executor.complete(transaction);
                    }
                }
            },
            Err(Abort::Abandon { description }) => {
                self.executor.abandon(transaction, &description);
            }
            Err(abort) => {
                if let Abort::RequiresDependency { object, intent, .. } = &abort {
                    self.fetch(*object, priority, *intent);
                }
                self.executor.record_abort(transaction, abort);
            }
        }
    }

    fn settle_commit(&mut self, outcome: CommitOutcome) {
        match outcome {
            CommitOutcome::Committed {
                transaction,
                journal,
                mode,
                borrowed,
            } => {
                journal.apply(&mut self.world);
                if mode == CommitMode::TransferAuthority {
                    for object in borrowed {
                        self.world.registry.set_owner(object, self.world.local);
                    }
                }
                self.executor.complete(transaction);
            }
            CommitOutcome::Aborted { transaction, reason } => {
                self.executor
                    .record_abort(transaction, Abort::CommitDenied { description: reason });
            }
        }
    }

    // ── Dependencies ──────────────────────────────────────────────────────────

    /// Ask for a missing object unless a request for it is already out.
    fn fetch(&mut self, object: ObjectId, priority: WorkPriority, intent: MigrationIntent) {
        if self
            .fetching
            .get(&object)
            .is_some_and(|since| since.elapsed() < self.fetch_retry)
        {
            return;
        }
        let target = self.fetch_target(object);
        self.fetching.insert(object, Instant::now());
        tracing::debug!(object = %object, to = %target, %priority, ?intent, "requesting dependency");
        self.sender
            .request_object(target, object, self.world.local, priority, intent, target);
    }

    /// Best guess at who can hand over `object`.
    fn fetch_target(&self, object: ObjectId) -> ServerId {
        let local = self.world.local;
        let registry = &self.world.registry;
        [registry.resident_of(object), registry.owner_of(object), object.server_id()]
            .into_iter()
            .find(|s| *s != local && s.is_peer())
            .unwrap_or(ServerId::DATABASE)
    }

    fn is_waiting_on_fetch(&self, transaction: TransactionId) -> bool {
        let Some(unit) = self.executor.unit(transaction) else {
            return false;
        };
        match &unit.last_abort {
            Some(Abort::RequiresDependency { object, .. }) if unit.state == UnitState::Queued => self
                .fetching
                .get(object)
                .is_some_and(|since| since.elapsed() < self.fetch_retry),
            _ => false,
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn handle_message(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        let from = envelope.from;
        tracing::trace!(from = %from, kind = envelope.message.kind(), "received");
        match envelope.message {
            PeerMessage::RequestObject {
                object,
                requester,
                priority,
                intent,
                ..
            } => {
                if self.transfers.record(object, requester, priority, intent) {
                    tracing::debug!(object = %object, %requester, %priority, "request parked");
                }
            }
            PeerMessage::DenyRequest {
                object,
                resident_hint,
                ..
            } => {
                self.fetching.remove(&object);
                match resident_hint {
                    Some(hint) if hint.server != self.world.local => {
                        self.world.registry.find_or_create_stub(object, Some(hint));
                        tracing::debug!(object = %object, resident = %hint.server, "request denied, following hint");
                    }
                    _ => tracing::debug!(object = %object, from = %from, "request denied"),
                }
            }
            PeerMessage::Snapshot { snapshot, metadata } => {
                let arrival = transfer::receive_snapshot(&mut self.world, &snapshot, &metadata, from)
                    .map_err(|source| EngineError::RequestedObjectMissing {
                        object: metadata.requested,
                        source,
                    })?;
                for object in &arrival.objects {
                    self.fetching.remove(object);
                }
                self.remember_migrations(arrival.contexts);
            }
            PeerMessage::StoreSnapshot { object, .. } => {
                tracing::debug!(object = %object, from = %from, "store request sent to a non-database peer");
            }
            PeerMessage::Begin {
                commit,
                priority,
                objects,
                mode,
            } => {
                if let Some(outcome) = self.commits.handle_begin(
                    from,
                    commit,
                    priority,
                    objects,
                    mode,
                    &self.world.registry,
                    &self.sender,
                ) {
                    self.settle_commit(outcome);
                }
            }
            PeerMessage::Ready { commit, states } => {
                if let Some(outcome) =
                    self.commits
                        .handle_ready(from, commit, states, &self.world.registry, &self.sender)?
                {
                    self.settle_commit(outcome);
                }
            }
            PeerMessage::Abort { commit, reason } => {
                if let Some(outcome) = self.commits.handle_abort(from, commit, reason, &self.sender)? {
                    self.settle_commit(outcome);
                }
            }
            PeerMessage::Commit { commit } => {
                self.commits
                    .handle_commit(from, commit, &mut self.world.registry)?;
            }
            PeerMessage::Invoke {
                function,
                args,
                priority,
            } => match self.functions.get(&function) {
                Some(build) => {
                    let closure = build(args);
                    self.executor.enqueue(function, Some(priority), true, closure);
                }
                None => {
                    tracing::warn!(function = %function, from = %from, "invoke for unregistered function");
                }
            },
        }
        Ok(())
    }

    fn departed(&mut self, departure: Departure) {
        if let Some(outcome) = self
            .commits
            .abort_for_departure(&departure.objects, &self.sender)
        {
            self.settle_commit(outcome);
        }
        self.remember_migrations(departure.contexts);
    }

    fn remember_migrations(&mut self, contexts: Vec<MigrationContext>) {
        self.migrations.extend(contexts);
        while self.migrations.len() > MIGRATION_HISTORY {
            self.migrations.pop_front();
        }
    }

    // ── Object operations ─────────────────────────────────────────────────────

    /// Send a borrowed object's closure back to its owner.
    ///
    /// Returns false if the object is already owned here.
    pub fn return_borrowed(&mut self, object: ObjectId) -> Result<bool, EngineError> {
        if !self.world.objects.contains(object) {
            return Err(EngineError::NotResident(object));
        }
        let root = self.world.canonical_root(object);
        let owner = self.world.registry.owner_of(root);
        if owner == self.world.local || !owner.is_peer() {
            return Ok(false);
        }
        let departure = transfer::send_closure(
            &mut self.world,
            object,
            owner,
            MigrationIntent::Borrow,
            &self.sender,
        )?;
        self.departed(departure);
        Ok(true)
    }

    /// Put `object` and its inners back to their prototype's field values.
    /// Returns the number of objects patched.
    pub fn reset_to_prototype(&mut self, object: ObjectId) -> Result<usize, EngineError> {
        let prototype = self
            .world
            .objects
            .get(object)
            .ok_or(EngineError::NotResident(object))?
            .prototype;
        let Some(prototype) = prototype else {
            return Ok(0);
        };
        let delta = serializer::delta_snapshot(&self.world, prototype, object)?;
        let patched = serializer::deserialize(&mut self.world, &delta)?;
        tracing::debug!(object = %object, %prototype, patched = patched.objects.len(), "reset to prototype");
        Ok(patched.objects.len())
    }

    /// Ship the closure around `object` to the Database peer.
    pub fn persist(&mut self, object: ObjectId) -> Result<(), EngineError> {
        if !self.world.objects.contains(object) {
            return Err(EngineError::NotResident(object));
        }
        let root = self.world.canonical_root(object);
        let snapshot = serializer::snapshot(&self.world, root, root)?;
        tracing::info!(object = %root, objects = snapshot.object_count(), "persisting closure");
        self.sender.send(
            ServerId::DATABASE,
            PeerMessage::StoreSnapshot {
                object: root,
                snapshot,
            },
        );
        Ok(())
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server: self.world.local,
            units: self
                .executor
                .units()
                .map(|u| UnitStatus {
                    name: u.name.clone(),
                    transaction: u.transaction,
                    priority: u.priority.to_string(),
                    state: u.state,
                    execution_attempts: u.execution_attempts,
                    last_abort: u.last_abort.as_ref().map(ToString::to_string),
                })
                .collect(),
            resident_objects: self.world.objects.len(),
            owned_objects: self.world.registry.owned_ids().len(),
            pending_requests: self.transfers.len(),
            commit: self.commits.role(),
            executor: self.executor.stats(),
            commits: self.commits.stats(),
        }
    }
}

/// Snapshot of a server's state for logs.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server: ServerId,
    pub units: Vec<UnitStatus>,
    pub resident_objects: usize,
    pub owned_objects: usize,
    pub pending_requests: usize,
    pub commit: CommitRole,
    pub executor: ExecutorStats,
    pub commits: CommitStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub transaction: TransactionId,
    pub priority: String,
    pub state: UnitState,
    pub execution_attempts: u32,
    pub last_abort: Option<String>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures that stop a server.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol violation: {verb} for commit {commit} from {from}")]
    ProtocolViolation {
        verb: &'static str,
        commit: CommitId,
        from: ServerId,
    },

    #[error("requested object {object} could not be installed")]
    RequestedObjectMissing {
        object: ObjectId,
        #[source]
        source: SerializationError,
    },

    #[error("object {0} is not resident")]
    NotResident(ObjectId),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
