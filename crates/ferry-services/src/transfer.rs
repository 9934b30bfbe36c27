//! Migration arbitration and transfer.
//!
//! Every request a server receives for an object is parked here, one entry
//! per (object, requester), highest priority first and oldest first within
//! a priority. Each scheduler pass runs `arbitrate`: a resident object goes
//! to the best requester unless a stronger local unit is using it, and the
//! losing requests chase the object to its new home. Requests for objects
//! that are not resident follow the registry's resident hint.

use std::collections::BTreeMap;

use ferry_core::migration::MigrationContext;
use ferry_core::wire::{MigrationIntent, MigrationMetadata};
use ferry_core::{GraphSnapshot, ObjectId, ServerId, WorkPriority};

use crate::channel::PeerSender;
use crate::executor::Executor;
use crate::object::Object;
use crate::serializer::{self, SerializationError};
use crate::world::World;

/// One outstanding ask for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMigrationRequest {
    pub requester: ServerId,
    pub priority: WorkPriority,
    pub intent: MigrationIntent,
    /// Arrival order, for tie-breaking.
    arrival: u64,
}

#[derive(Debug, Default)]
pub struct TransferQueue {
    pending: BTreeMap<ObjectId, Vec<PendingMigrationRequest>>,
    arrivals: u64,
}

/// An object closure that left this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub root: ObjectId,
    pub requested: ObjectId,
    pub destination: ServerId,
    pub objects: Vec<ObjectId>,
    pub contexts: Vec<MigrationContext>,
}

/// An object closure that arrived at this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub requested: ObjectId,
    pub objects: Vec<ObjectId>,
    pub contexts: Vec<MigrationContext>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request. A repeat from the same requester keeps its place
    /// in line and takes the new priority and intent. Returns true if the
    /// request is new.
    pub fn record(
        &mut self,
        object: ObjectId,
        requester: ServerId,
        priority: WorkPriority,
        intent: MigrationIntent,
    ) -> bool {
        let requests = self.pending.entry(object).or_default();
        let fresh = match requests.iter_mut().find(|r| r.requester == requester) {
            Some(existing) => {
                existing.priority = priority;
                existing.intent = intent;
                false
            }
            None => {
                self.arrivals += 1;
                requests.push(PendingMigrationRequest {
                    requester,
                    priority,
                    intent,
                    arrival: self.arrivals,
                });
                true
            }
        };
        requests.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.arrival.cmp(&b.arrival)));
        fresh
    }

    pub fn pending_for(&self, object: ObjectId) -> &[PendingMigrationRequest] {
        self.pending.get(&object).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total parked requests.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self, object: ObjectId) -> Vec<PendingMigrationRequest> {
        self.pending.remove(&object).unwrap_or_default()
    }

    fn restore(&mut self, object: ObjectId, requests: Vec<PendingMigrationRequest>) {
        self.pending.insert(object, requests);
    }

    /// One arbitration pass over every object with parked requests.
    pub fn arbitrate(
        &mut self,
        world: &mut World,
        executor: &Executor,
        sender: &PeerSender,
    ) -> Vec<Departure> {
        let local = world.local;
        let mut departures = Vec::new();
        let objects: Vec<ObjectId> = self.pending.keys().copied().collect();

        for object in objects {
            let requests = self.take(object);
            let Some(&winner) = requests.first() else {
                continue;
            };

            if object.is_asset() {
                for request in &requests {
                    sender.deny_request(object, request.requester, None);
                }
                continue;
            }

            if !world.objects.contains(object) {
                forward_to_resident(world, object, &requests, sender);
                continue;
            }

            if winner.requester == local {
                // Our own request came back around while the object is here.
                let rest: Vec<_> = requests.into_iter().skip(1).collect();
                if !rest.is_empty() {
                    self.restore(object, rest);
                }
                continue;
            }

            let root = world.canonical_root(object);
            let held = executor.claims().any(|(priority, touched)| {
                priority > winner.priority
                    && touched.iter().any(|&t| world.canonical_root(t) == root)
            });
            if held {
                tracing::debug!(
                    object = %object,
                    requester = %winner.requester,
                    priority = %winner.priority,
                    "stronger local claim, object stays"
                );
                self.restore(object, requests);
                continue;
            }

            match send_closure(world, object, winner.requester, winner.intent, sender) {
                Ok(departure) => {
                    for request in requests.iter().skip(1) {
                        forward(sender, object, *request, winner.requester);
                    }
                    departures.push(departure);
                }
                Err(e) => {
                    tracing::warn!(object = %object, error = %e, "could not capture object, denying");
                    for request in &requests {
                        sender.deny_request(object, request.requester, None);
                    }
                }
            }
        }
        departures
    }
}

/// Pass a request on towards `destination`, or deny it if that would send
/// it straight back to its requester.
fn forward(
    sender: &PeerSender,
    object: ObjectId,
    request: PendingMigrationRequest,
    destination: ServerId,
) {
    if request.requester == destination || destination == sender.local() {
        sender.deny_request(object, request.requester, None);
        return;
    }
    tracing::debug!(
        object = %object,
        requester = %request.requester,
        to = %destination,
        "forwarding request"
    );
    sender.request_object(
        destination,
        object,
        request.requester,
        request.priority,
        request.intent,
        destination,
    );
}

fn forward_to_resident(
    world: &mut World,
    object: ObjectId,
    requests: &[PendingMigrationRequest],
    sender: &PeerSender,
) {
    let stub = world.registry.find_or_create_stub(object, None).clone();
    for request in requests {
        if request.requester == stub.resident || stub.resident == world.local {
            sender.deny_request(object, request.requester, Some(stub.hint()));
        } else {
            forward(sender, object, *request, stub.resident);
        }
    }
}

/// Snapshot the closure around `requested`, ship it to `destination` and
/// drop it from the local arena.
pub fn send_closure(
    world: &mut World,
    requested: ObjectId,
    destination: ServerId,
    intent: MigrationIntent,
    sender: &PeerSender,
) -> Result<Departure, SerializationError> {
    let local = world.local;
    let root = world.canonical_root(requested);
    let owner_before = world.registry.owner_of(root);
    let reassign = intent == MigrationIntent::TakeOwnership && world.registry.is_owned_locally(root);
    let new_owner = if reassign { destination } else { owner_before };

    let mut snapshot = serializer::snapshot(world, root, requested)?;
    let mut objects = Vec::with_capacity(snapshot.headers.len());
    let mut contexts = Vec::with_capacity(snapshot.headers.len());

    for position in 0..snapshot.headers.len() {
        let Some(id) = snapshot.header_id(position) else {
            continue;
        };
        let header = &mut snapshot.headers[position];
        let object_owner_before = header.owner;
        header.owner_before = object_owner_before;
        if reassign {
            header.owner = destination;
        }
        header.serial = world.registry.next_serial(id);
        world
            .registry
            .mark_departed(id, destination, header.owner, header.serial);

        let ctx = MigrationContext::send(id, local, destination, header.owner, object_owner_before);
        if let Some(mut object) = world.objects.remove(id) {
            run_post_migrate(world, &mut object, &ctx);
        }
        objects.push(id);
        contexts.push(ctx);
    }

    tracing::info!(
        object = %requested,
        root = %root,
        to = %destination,
        objects = objects.len(),
        bytes = snapshot.byte_len(),
        kind = %classify(&contexts),
        "object sent"
    );

    let metadata = MigrationMetadata {
        requested,
        sender: local,
        new_owner,
        owner_before,
        intent,
    };
    sender.send_snapshot(destination, snapshot, metadata);

    Ok(Departure {
        root,
        requested,
        destination,
        objects,
        contexts,
    })
}

/// Install an arrived closure and record the new residency.
pub fn receive_snapshot(
    world: &mut World,
    snapshot: &GraphSnapshot,
    metadata: &MigrationMetadata,
    from: ServerId,
) -> Result<Arrival, SerializationError> {
    let local = world.local;
    let result = serializer::deserialize(world, snapshot)?;
    let mut contexts = Vec::with_capacity(result.objects.len());

    for (position, header) in snapshot.headers.iter().enumerate() {
        let Some(id) = snapshot.header_id(position) else {
            continue;
        };
        if !result.objects.contains(&id) {
            continue;
        }
        let (name, outer) = match world.objects.get(id) {
            Some(object) => (object.name.clone(), object.outer),
            None => continue,
        };
        world.registry.mark_arrived(
            id,
            &name,
            outer,
            header.owner,
            header.physics_authority,
            header.serial,
        );

        let ctx = MigrationContext::receive(id, local, from, header.owner, header.owner_before);
        if let Some(mut object) = world.objects.remove(id) {
            run_post_migrate(world, &mut object, &ctx);
            world.objects.insert(object);
        }
        contexts.push(ctx);
    }

    tracing::info!(
        object = %result.requested,
        from = %from,
        intent = ?metadata.intent,
        objects = result.objects.len(),
        kind = %classify(&contexts),
        "object received"
    );

    Ok(Arrival {
        requested: result.requested,
        objects: result.objects,
        contexts,
    })
}

fn run_post_migrate(world: &World, object: &mut Object, ctx: &MigrationContext) {
    if let Some(hook) = world.kinds.get(object.kind).and_then(|k| k.post_migrate) {
        hook(object, ctx);
    }
}

/// Classification of the first context, for logs.
fn classify(contexts: &[MigrationContext]) -> String {
    match contexts.first() {
        Some(ctx) if ctx.side == ferry_core::MigrationSide::Send => ctx.send_type().to_string(),
        Some(ctx) => ctx.recv_type().to_string(),
        None => "empty".to_string(),
    }
}
