//! Attempt context for transactional work.
//!
//! A work unit's closure receives a `Txn`. Reads see the arena through the
//! attempt's own writes; writes go to a copy-on-write journal that the
//! executor applies on success and drops on abort. The only way to have an
//! effect that survives an abort is `Txn::open`, which runs immediately.

use std::collections::{BTreeMap, BTreeSet};

use ferry_core::wire::{CommitMode, MigrationIntent};
use ferry_core::{IdGenerator, ObjectId, PeerMessage, ServerId, TransactionId, WorkPriority};

use crate::channel::PeerSender;
use crate::object::{KindRegistry, KindTag, Object, ObjectArena, Value};
use crate::registry::Registry;
use crate::world::World;

/// Why an attempt stopped before reaching the end of its closure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Abort {
    /// A needed object is not resident. The unit is retried once it is.
    #[error("requires dependency {object}: {description}")]
    RequiresDependency {
        object: ObjectId,
        description: String,
        intent: MigrationIntent,
    },

    /// The unit can never succeed and is dropped.
    #[error("abandoned: {description}")]
    Abandon { description: String },

    /// The unit's multi-server commit did not go through. Retried.
    #[error("commit denied: {description}")]
    CommitDenied { description: String },
}

impl Abort {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Abort::Abandon { .. })
    }
}

/// Closure type stored by the executor. Must be safe to run any number
/// of times; only `Txn::open` effects escape an aborted attempt.
pub type WorkFn = Box<dyn FnMut(&mut Txn<'_>) -> Result<(), Abort> + Send>;

/// Box a closure as a `WorkFn`.
pub fn work<F>(closure: F) -> WorkFn
where
    F: FnMut(&mut Txn<'_>) -> Result<(), Abort> + Send + 'static,
{
    Box::new(closure)
}

/// Why a unit needs a multi-server commit, and what the commit does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequirement {
    pub reason: String,
    pub mode: CommitMode,
}

/// Speculative writes of one attempt.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    /// Full copies of every written object, including created ones.
    pub writes: BTreeMap<ObjectId, Object>,
    pub created: Vec<ObjectId>,
    /// Every object read or written this attempt.
    pub touched: BTreeSet<ObjectId>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Touched objects held here but owned elsewhere (borrowed ones).
    pub fn borrowed(&self, registry: &Registry) -> Vec<ObjectId> {
        self.touched
            .iter()
            .copied()
            .filter(|id| {
                !self.created.contains(id)
                    && registry.is_resident(*id)
                    && !registry.is_owned_locally(*id)
            })
            .collect()
    }

    /// Make the attempt's writes visible. Returns the number of objects
    /// written.
    pub fn apply(self, world: &mut World) -> usize {
        let mut applied = 0;
        for (id, object) in self.writes {
            if self.created.contains(&id) {
                world.insert_local(object);
            } else if world.objects.contains(id) {
                world.objects.insert(object);
            } else {
                tracing::warn!(object = %id, "journaled object left before apply, write lost");
                continue;
            }
            applied += 1;
        }
        applied
    }
}

/// What an attempt produced, handed back to the executor.
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub journal: Journal,
    pub commit: Option<CommitRequirement>,
}

pub struct Txn<'a> {
    objects: &'a ObjectArena,
    registry: &'a Registry,
    kinds: &'a KindRegistry,
    ids: &'a mut IdGenerator,
    sender: &'a PeerSender,
    transaction: TransactionId,
    priority: WorkPriority,
    journal: Journal,
    commit: Option<CommitRequirement>,
}

impl<'a> Txn<'a> {
    pub fn new(
        world: &'a mut World,
        sender: &'a PeerSender,
        transaction: TransactionId,
        priority: WorkPriority,
    ) -> Self {
        let World {
            objects,
            registry,
            kinds,
            ids,
            ..
        } = world;
        Self {
            objects,
            registry,
            kinds,
            ids,
            sender,
            transaction,
            priority,
            journal: Journal::default(),
            commit: None,
        }
    }

    pub fn local(&self) -> ServerId {
        self.registry.local()
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn priority(&self) -> WorkPriority {
        self.priority
    }

    /// Read-only view of the registry as of the start of the attempt.
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// Read an object, aborting if it is not resident.
    ///
    /// The object counts as touched even when the read aborts, so the
    /// unit's claim covers it once it arrives.
    pub fn get(&mut self, id: ObjectId) -> Result<&Object, Abort> {
        self.journal.touched.insert(id);
        self.ensure_resident(id, MigrationIntent::Borrow)?;
        match self.journal.writes.get(&id) {
            Some(object) => Ok(object),
            None => self.objects.get(id).ok_or_else(|| missing(id, MigrationIntent::Borrow)),
        }
    }

    /// Read an object this unit needs final authority over.
    ///
    /// A non-resident object is fetched with ownership. A resident but
    /// borrowed one makes the unit's commit transfer authority to us.
    pub fn get_owned(&mut self, id: ObjectId) -> Result<&Object, Abort> {
        self.journal.touched.insert(id);
        self.ensure_resident(id, MigrationIntent::TakeOwnership)?;
        if !self.journal.created.contains(&id) && !self.registry.is_owned_locally(id) {
            self.require_authority(format!("authority over {id}"));
        }
        self.get(id)
    }

    pub fn get_field(&mut self, id: ObjectId, field: &str) -> Result<Value, Abort> {
        Ok(self.get(id)?.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Mutable access through the journal.
    ///
    /// Writing an object borrowed from another owner makes the unit
    /// require a multi-server commit.
    pub fn write(&mut self, id: ObjectId) -> Result<&mut Object, Abort> {
        self.journal.touched.insert(id);
        self.ensure_resident(id, MigrationIntent::Borrow)?;
        if !self.journal.created.contains(&id) && !self.registry.is_owned_locally(id) {
            self.require_multi_server_commit(format!("write to borrowed {id}"));
        }
        if !self.journal.writes.contains_key(&id) {
            let copy = self
                .objects
                .get(id)
                .cloned()
                .ok_or_else(|| missing(id, MigrationIntent::Borrow))?;
            self.journal.writes.insert(id, copy);
        }
        match self.journal.writes.get_mut(&id) {
            Some(object) => Ok(object),
            None => Err(missing(id, MigrationIntent::Borrow)),
        }
    }

    pub fn set_field(&mut self, id: ObjectId, field: &str, value: impl Into<Value>) -> Result<(), Abort> {
        self.write(id)?.set(field, value);
        Ok(())
    }

    /// Create an object. It becomes visible (and registered) only if the
    /// attempt succeeds; its id is consumed either way.
    pub fn create_object(
        &mut self,
        kind: KindTag,
        name: &str,
        outer: Option<ObjectId>,
    ) -> Result<ObjectId, Abort> {
        let id = self.ids.generate(false);
        let object = self
            .kinds
            .construct(kind, id, name, outer)
            .ok_or_else(|| Abort::Abandon {
                description: format!("kind {} is not registered", kind.0),
            })?;
        self.journal.writes.insert(id, object);
        self.journal.created.push(id);
        self.journal.touched.insert(id);
        Ok(id)
    }

    /// Run an effect now, outside the journal. It is not undone if the
    /// attempt aborts and runs again on every attempt that reaches it.
    pub fn open<R>(&mut self, effect: impl FnOnce(&PeerSender) -> R) -> R {
        effect(self.sender)
    }

    /// Ask `server` to run a registered function as dependent work.
    /// An open effect: sent on every attempt that reaches it.
    pub fn invoke(&mut self, server: ServerId, function: &str, args: serde_json::Value) {
        let priority = self.priority.dependent();
        let function = function.to_string();
        self.open(|sender| {
            sender.send(
                server,
                PeerMessage::Invoke {
                    function,
                    args,
                    priority,
                },
            )
        });
    }

    /// Keep results local until every lender agrees.
    pub fn require_multi_server_commit(&mut self, reason: impl Into<String>) {
        if self.commit.is_none() {
            self.commit = Some(CommitRequirement {
                reason: reason.into(),
                mode: CommitMode::Snapshot,
            });
        }
    }

    /// Like `require_multi_server_commit`, and ownership of every borrowed
    /// object moves here when the commit lands.
    pub fn require_authority(&mut self, reason: impl Into<String>) {
        self.commit = Some(CommitRequirement {
            reason: reason.into(),
            mode: CommitMode::TransferAuthority,
        });
    }

    pub fn requires_multi_server_commit(&self) -> bool {
        self.commit.is_some()
    }

    pub fn abandon(&self, description: impl Into<String>) -> Abort {
        Abort::Abandon {
            description: description.into(),
        }
    }

    pub fn finish(self) -> AttemptOutcome {
        AttemptOutcome {
            journal: self.journal,
            commit: self.commit,
        }
    }

    fn ensure_resident(&self, id: ObjectId, intent: MigrationIntent) -> Result<(), Abort> {
        if self.journal.writes.contains_key(&id) || self.objects.contains(id) {
            return Ok(());
        }
        if id.is_asset() {
            return Err(Abort::Abandon {
                description: format!("asset content {id} is not loaded"),
            });
        }
        Err(missing(id, intent))
    }
}

fn missing(id: ObjectId, intent: MigrationIntent) -> Abort {
    Abort::RequiresDependency {
        object: id,
        description: format!("{id} is not resident"),
        intent,
    }
}
