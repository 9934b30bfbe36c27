//! Graph serializer — captures an object closure into a `GraphSnapshot`
//! and rebuilds (or patches) objects from one.
//!
//! A closure is the root plus every resident object that root owns:
//! anything reached through a reference or an inner link whose container
//! chain leads back to root without crossing a standalone object. Every
//! other reference leaves the package as an interned id, or as a name path
//! when the target is asset content the receiver already has.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use ferry_core::snapshot::{
    decode_fields, encode_fields, EncodedRef, EncodedValue, FieldRecord, ObjectHeader, PathName,
    PathSegment, SnapshotBuilder,
};
use ferry_core::wire::WireError;
use ferry_core::{GraphSnapshot, ObjectId};

use crate::object::{KindTag, Object, ObjectFlags, Value};
use crate::world::World;

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("object {0} is not resident")]
    NotResident(ObjectId),

    #[error("object {object} has unregistered kind {kind}")]
    UnknownKind { object: ObjectId, kind: u16 },

    #[error("requested object {0} is missing from the snapshot")]
    RequestedMissing(ObjectId),

    #[error("snapshot table index {0} out of range")]
    BadIndex(u32),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Result of applying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deserialized {
    /// Header position of the originally requested object.
    pub requested_index: u32,
    pub requested: ObjectId,
    /// Every object constructed or patched, in header order.
    pub objects: Vec<ObjectId>,
}

// ── Capture ───────────────────────────────────────────────────────────────────

/// Snapshot `root` and everything it owns.
///
/// `requested` is the object the remote side actually asked for; it is
/// always present in the result, even when traversal from `root` misses it.
pub fn snapshot(
    world: &World,
    root: ObjectId,
    requested: ObjectId,
) -> Result<GraphSnapshot, SerializationError> {
    if !world.objects.contains(root) {
        return Err(SerializationError::NotResident(root));
    }

    let mut order = collect_closure(world, root);
    if !order.contains(&requested) {
        match world.objects.get(requested) {
            Some(object) if !object.flags.contains(ObjectFlags::TRANSIENT) => {
                tracing::debug!(
                    root = %root,
                    requested = %requested,
                    "requested object outside traversal, adding explicitly"
                );
                order.push(requested);
            }
            _ => return Err(SerializationError::RequestedMissing(requested)),
        }
    }

    let mut encoder = Encoder::new(world, SnapshotBuilder::new(), &order);
    for &id in &order {
        let Some(object) = world.objects.get(id) else {
            continue;
        };
        let records: Vec<FieldRecord> = object
            .fields
            .iter()
            .map(|(name, value)| {
                let name = encoder.builder.intern_name(name);
                (name, encoder.encode_value(value))
            })
            .collect();
        let chunk = match encode_fields(&records) {
            Ok(chunk) => chunk,
            Err(e) if id == requested => return Err(e.into()),
            Err(e) => {
                tracing::warn!(object = %id, error = %e, "field capture failed, sending header only");
                Bytes::from_static(b"[]")
            }
        };
        let header = encoder.header_for(object);
        encoder.builder.push_object(header, chunk);
    }

    let requested_index = encoder.position(requested).unwrap_or(0);
    Ok(encoder.builder.finish(requested_index))
}

/// Patch that turns `root` back into a copy of `prototype`.
///
/// The prototype's inners are matched to root's inners by name. References
/// the prototype holds to its own inners are rewritten to point at root's
/// matching inners. Only fields whose value differs from root's current
/// value are written; fields the prototype lacks are sent as `Unset`.
pub fn delta_snapshot(
    world: &World,
    prototype: ObjectId,
    root: ObjectId,
) -> Result<GraphSnapshot, SerializationError> {
    if !world.objects.contains(prototype) {
        return Err(SerializationError::NotResident(prototype));
    }
    if !world.objects.contains(root) {
        return Err(SerializationError::NotResident(root));
    }

    let pairs = match_prototype(world, prototype, root);
    let live: Vec<ObjectId> = pairs.iter().map(|&(_, l)| l).collect();
    let mut encoder = Encoder::new(world, SnapshotBuilder::delta(), &live);
    encoder.remap = pairs.iter().copied().collect();

    for &(proto_id, live_id) in &pairs {
        let (Some(proto), Some(object)) = (world.objects.get(proto_id), world.objects.get(live_id))
        else {
            continue;
        };
        let mut records = Vec::new();
        for (name, value) in &proto.fields {
            let target = encoder.remap_value(value);
            if object.fields.get(name) == Some(&target) {
                continue;
            }
            let name = encoder.builder.intern_name(name);
            records.push((name, encoder.encode_value(value)));
        }
        for name in object.fields.keys().filter(|k| !proto.fields.contains_key(*k)) {
            let name = encoder.builder.intern_name(name);
            records.push((name, EncodedValue::Unset));
        }
        let chunk = encode_fields(&records)?;
        let header = encoder.header_for(object);
        encoder.builder.push_object(header, chunk);
    }

    Ok(encoder.builder.finish(0))
}

/// Root first, then breadth-first over references and inners.
fn collect_closure(world: &World, root: ObjectId) -> Vec<ObjectId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(object) = world.objects.get(id) else {
            continue;
        };
        if object.flags.contains(ObjectFlags::TRANSIENT) {
            continue;
        }
        order.push(id);

        let mut next = object.references();
        next.extend(world.objects.inners_of(id));
        for candidate in next {
            if !seen.contains(&candidate) && is_owned_by(world, candidate, root) {
                queue.push_back(candidate);
            }
        }
    }
    order
}

/// True if `id`'s container chain reaches `root` without passing through
/// a standalone object.
fn is_owned_by(world: &World, id: ObjectId, root: ObjectId) -> bool {
    let mut current = id;
    for _ in 0..=world.objects.len() {
        if current == root {
            return true;
        }
        let Some(object) = world.objects.get(current) else {
            return false;
        };
        if object.flags.contains(ObjectFlags::STANDALONE) {
            return false;
        }
        match object.outer {
            Some(outer) => current = outer,
            None => return false,
        }
    }
    false
}

/// `(prototype object, live object)` pairs, prototype root first.
fn match_prototype(world: &World, prototype: ObjectId, root: ObjectId) -> Vec<(ObjectId, ObjectId)> {
    let mut pairs = Vec::new();
    let mut stack = vec![(prototype, root)];
    while let Some((proto, live)) = stack.pop() {
        if pairs.iter().any(|&(p, _)| p == proto) {
            continue;
        }
        pairs.push((proto, live));
        for inner in world.objects.inners_of(proto) {
            let Some(object) = world.objects.get(inner) else {
                continue;
            };
            if object.flags.contains(ObjectFlags::TRANSIENT) {
                continue;
            }
            match world.objects.find_by_name(Some(live), &object.name) {
                Some(live_inner) => stack.push((inner, live_inner)),
                None => tracing::debug!(
                    prototype = %inner,
                    name = %object.name,
                    "no live counterpart for prototype inner"
                ),
            }
        }
    }
    pairs
}

struct Encoder<'a> {
    world: &'a World,
    builder: SnapshotBuilder,
    positions: HashMap<ObjectId, u32>,
    /// Prototype id to live id, for delta capture.
    remap: HashMap<ObjectId, ObjectId>,
}

impl<'a> Encoder<'a> {
    fn new(world: &'a World, builder: SnapshotBuilder, order: &[ObjectId]) -> Self {
        let positions = order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as u32))
            .collect();
        Self {
            world,
            builder,
            positions,
            remap: HashMap::new(),
        }
    }

    fn position(&self, id: ObjectId) -> Option<u32> {
        self.positions.get(&id).copied()
    }

    fn header_for(&mut self, object: &Object) -> ObjectHeader {
        let world = self.world;
        let registry = &world.registry;
        let owner = registry.owner_of(object.id);
        ObjectHeader {
            name: self.builder.intern_name(&object.name),
            id: self.builder.intern_id(object.id),
            kind: object.kind.0,
            outer: self.encode_ref(object.outer),
            prototype: self.encode_ref(object.prototype),
            flags: object.flags.bits(),
            owner,
            owner_before: owner,
            physics_authority: registry.physics_authority(object.id),
            serial: registry.last_known_serial(object.id),
        }
    }

    fn encode_ref(&mut self, target: Option<ObjectId>) -> EncodedRef {
        let Some(target) = target else {
            return EncodedRef::Null;
        };
        let target = self.remap.get(&target).copied().unwrap_or(target);
        if let Some(position) = self.position(target) {
            return EncodedRef::Local(position);
        }
        if target.is_asset() {
            if let Some(path) = self.path_of(target) {
                return EncodedRef::Path(self.builder.intern_path(path));
            }
        }
        EncodedRef::Id(self.builder.intern_id(target))
    }

    fn path_of(&mut self, target: ObjectId) -> Option<PathName> {
        let world = self.world;
        let chain: Vec<(String, ObjectId)> = world
            .objects
            .outer_chain(target)
            .into_iter()
            .filter_map(|id| world.objects.get(id).map(|o| (o.name.clone(), id)))
            .collect();
        if chain.is_empty() {
            return None;
        }
        let segments = chain
            .into_iter()
            .map(|(name, id)| PathSegment {
                name: self.builder.intern_name(&name),
                id: self.builder.intern_id(id),
            })
            .collect();
        Some(PathName { segments })
    }

    fn encode_value(&mut self, value: &Value) -> EncodedValue {
        match value {
            Value::Null => EncodedValue::Null,
            Value::Bool(v) => EncodedValue::Bool(*v),
            Value::Int(v) => EncodedValue::Int(*v),
            Value::Float(v) => EncodedValue::Float(*v),
            Value::Str(v) => EncodedValue::Str(v.clone()),
            Value::Bytes(v) => EncodedValue::Bytes(v.clone()),
            Value::Ref(target) => EncodedValue::Ref(self.encode_ref(*target)),
            Value::List(items) => {
                EncodedValue::List(items.iter().map(|v| self.encode_value(v)).collect())
            }
        }
    }

    /// `value` with prototype references rewritten to live ones.
    fn remap_value(&self, value: &Value) -> Value {
        match value {
            Value::Ref(Some(id)) => Value::Ref(Some(self.remap.get(id).copied().unwrap_or(*id))),
            Value::List(items) => Value::List(items.iter().map(|v| self.remap_value(v)).collect()),
            other => other.clone(),
        }
    }
}

// ── Apply ─────────────────────────────────────────────────────────────────────

/// Rebuild or patch objects from a snapshot.
///
/// Headers are processed first so every object exists before any field
/// that might point at it is applied. An existing object is reused unless
/// it is pending kill or of a different kind. Objects that fail are
/// skipped; only a failure on the requested object is an error.
///
/// Registry bookkeeping for migrations is the caller's job; the only
/// registry change made here is a stub for each referenced id that is not
/// resident.
pub fn deserialize(
    world: &mut World,
    snapshot: &GraphSnapshot,
) -> Result<Deserialized, SerializationError> {
    let requested_index = snapshot.requested;
    let requested = snapshot
        .requested_id()
        .ok_or(SerializationError::BadIndex(requested_index))?;
    let delta = snapshot.is_delta();

    // Header pass.
    let mut placed: Vec<Option<ObjectId>> = vec![None; snapshot.headers.len()];
    let mut constructed: Vec<ObjectId> = Vec::new();
    for (position, header) in snapshot.headers.iter().enumerate() {
        let Some(id) = snapshot.id(header.id) else {
            tracing::warn!(position, "header id out of range, skipping");
            continue;
        };
        let reusable = world
            .objects
            .get(id)
            .is_some_and(|o| !o.flags.contains(ObjectFlags::PENDING_KILL) && o.kind.0 == header.kind);

        if reusable {
            placed[position] = Some(id);
            continue;
        }
        if delta {
            if id == requested {
                return Err(SerializationError::RequestedMissing(id));
            }
            tracing::warn!(object = %id, "patch target not resident, skipping");
            continue;
        }

        let name = snapshot.name(header.name).unwrap_or_default();
        match world.kinds.construct(KindTag(header.kind), id, name, None) {
            Some(object) => {
                world.objects.insert(object);
                placed[position] = Some(id);
                constructed.push(id);
            }
            None if id == requested => {
                discard(world, &constructed);
                return Err(SerializationError::UnknownKind {
                    object: id,
                    kind: header.kind,
                });
            }
            None => {
                tracing::warn!(object = %id, kind = header.kind, "unregistered kind, skipping");
            }
        }
    }

    // Field pass.
    for (position, header) in snapshot.headers.iter().enumerate() {
        let Some(id) = placed[position] else {
            continue;
        };
        match decode_object(world, snapshot, header, position) {
            Ok(decoded) => apply_decoded(world, id, decoded, delta),
            Err(e) if id == requested => {
                discard(world, &constructed);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(object = %id, error = %e, "field apply failed, skipping");
                placed[position] = None;
                if constructed.contains(&id) {
                    discard(world, &[id]);
                }
            }
        }
    }

    let objects: Vec<ObjectId> = placed.into_iter().flatten().collect();
    if !objects.contains(&requested) {
        discard(world, &constructed);
        return Err(SerializationError::RequestedMissing(requested));
    }

    // Second pass: everything referenced but not here gets a stub.
    for &id in &objects {
        let Some(object) = world.objects.get(id) else {
            continue;
        };
        let mut refs = object.references();
        refs.extend(object.outer);
        refs.extend(object.prototype);
        for target in refs {
            if !target.is_asset() && !world.objects.contains(target) {
                world.registry.find_or_create_stub(target, None);
            }
        }
    }

    Ok(Deserialized {
        requested_index,
        requested,
        objects,
    })
}

/// Drop objects this call built but could not finish.
fn discard(world: &mut World, ids: &[ObjectId]) {
    for id in ids {
        world.objects.remove(*id);
    }
}

struct DecodedObject {
    name: String,
    outer: Option<ObjectId>,
    prototype: Option<ObjectId>,
    flags: ObjectFlags,
    fields: BTreeMap<String, Value>,
    /// Fields a patch clears.
    unset: Vec<String>,
}

fn decode_object(
    world: &World,
    snapshot: &GraphSnapshot,
    header: &ObjectHeader,
    position: usize,
) -> Result<DecodedObject, SerializationError> {
    let chunk = snapshot
        .chunks
        .get(position)
        .ok_or(SerializationError::BadIndex(position as u32))?;
    let mut fields = BTreeMap::new();
    let mut unset = Vec::new();
    for (name, value) in decode_fields(chunk)? {
        let name = snapshot
            .name(name)
            .ok_or(SerializationError::BadIndex(name))?;
        if value == EncodedValue::Unset {
            unset.push(name.to_string());
            continue;
        }
        fields.insert(name.to_string(), decode_value(world, snapshot, &value)?);
    }
    Ok(DecodedObject {
        name: snapshot.name(header.name).unwrap_or_default().to_string(),
        outer: resolve_ref(world, snapshot, header.outer)?,
        prototype: resolve_ref(world, snapshot, header.prototype)?,
        flags: ObjectFlags::from_bits(header.flags),
        fields,
        unset,
    })
}

fn apply_decoded(world: &mut World, id: ObjectId, decoded: DecodedObject, delta: bool) {
    let Some(object) = world.objects.get_mut(id) else {
        return;
    };
    if delta {
        for name in &decoded.unset {
            object.fields.remove(name);
        }
        object.fields.extend(decoded.fields);
        return;
    }
    object.name = decoded.name;
    object.outer = decoded.outer;
    object.prototype = decoded.prototype;
    object.flags = decoded.flags;
    object.fields = decoded.fields;
}

fn decode_value(
    world: &World,
    snapshot: &GraphSnapshot,
    value: &EncodedValue,
) -> Result<Value, SerializationError> {
    Ok(match value {
        EncodedValue::Null => Value::Null,
        EncodedValue::Bool(v) => Value::Bool(*v),
        EncodedValue::Int(v) => Value::Int(*v),
        EncodedValue::Float(v) => Value::Float(*v),
        EncodedValue::Str(v) => Value::Str(v.clone()),
        EncodedValue::Bytes(v) => Value::Bytes(v.clone()),
        EncodedValue::Ref(r) => Value::Ref(resolve_ref(world, snapshot, *r)?),
        EncodedValue::List(items) => Value::List(
            items
                .iter()
                .map(|v| decode_value(world, snapshot, v))
                .collect::<Result<_, _>>()?,
        ),
        EncodedValue::Unset => Value::Null,
    })
}

fn resolve_ref(
    world: &World,
    snapshot: &GraphSnapshot,
    reference: EncodedRef,
) -> Result<Option<ObjectId>, SerializationError> {
    match reference {
        EncodedRef::Null => Ok(None),
        EncodedRef::Local(position) => snapshot
            .header_id(position as usize)
            .map(Some)
            .ok_or(SerializationError::BadIndex(position)),
        EncodedRef::Id(index) => snapshot
            .id(index)
            .map(Some)
            .ok_or(SerializationError::BadIndex(index)),
        EncodedRef::Path(index) => resolve_path(world, snapshot, index).map(Some),
    }
}

/// Find a path target by name, outermost container first. Falls back to
/// the target's id when any link is missing here.
fn resolve_path(
    world: &World,
    snapshot: &GraphSnapshot,
    index: u32,
) -> Result<ObjectId, SerializationError> {
    let path = snapshot
        .paths
        .get(index as usize)
        .ok_or(SerializationError::BadIndex(index))?;
    let target = path.segments.first().ok_or(SerializationError::BadIndex(index))?;
    let fallback = snapshot
        .id(target.id)
        .ok_or(SerializationError::BadIndex(target.id))?;

    let mut outer = None;
    for segment in path.segments.iter().rev() {
        let Some(name) = snapshot.name(segment.name) else {
            return Ok(fallback);
        };
        match world.objects.find_by_name(outer, name) {
            Some(found) => outer = Some(found),
            None => return Ok(fallback),
        }
    }
    Ok(outer.unwrap_or(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{KindInfo, KindRegistry};
    use ferry_core::snapshot::SNAPSHOT_FLAG_DELTA;
    use ferry_core::ServerId;

    const CRATE_KIND: KindTag = KindTag(7);

    fn kinds() -> KindRegistry {
        let mut kinds = KindRegistry::new();
        kinds.register(KindInfo {
            tag: CRATE_KIND,
            name: "crate",
            defaults: BTreeMap::new,
            post_migrate: None,
        });
        kinds
    }

    fn world(server: u16) -> World {
        World::new(ServerId::new(server), kinds())
    }

    fn spawn(w: &mut World, name: &str, outer: Option<ObjectId>) -> ObjectId {
        w.spawn(KindTag::GENERIC, name, outer, false).unwrap()
    }

    fn set(w: &mut World, id: ObjectId, field: &str, value: impl Into<Value>) {
        w.objects.get_mut(id).unwrap().set(field, value);
    }

    /// Root with two inners that point at each other and back at root,
    /// plus references to an unrelated object and to asset content.
    fn linked_graph(w: &mut World) -> (ObjectId, ObjectId, ObjectId, ObjectId, ObjectId) {
        let asset_pkg = w.spawn(KindTag::GENERIC, "content", None, true).unwrap();
        let asset = w
            .spawn(KindTag::GENERIC, "mesh", Some(asset_pkg), true)
            .unwrap();
        let other = spawn(w, "elsewhere", None);
        let root = spawn(w, "ship", None);
        let hull = spawn(w, "hull", Some(root));
        let cargo = spawn(w, "cargo", Some(root));

        set(w, root, "hp", 100i64);
        set(w, root, "neighbour", other);
        set(w, root, "mesh", asset);
        set(w, hull, "sibling", cargo);
        set(w, cargo, "owner", root);
        set(w, cargo, "tags", Value::List(vec!["a".into(), Value::Ref(Some(hull))]));
        (root, hull, cargo, other, asset)
    }

    #[test]
    fn closure_includes_inners_and_excludes_outsiders() {
        let mut w = world(1);
        let (root, hull, cargo, other, asset) = linked_graph(&mut w);
        let snap = snapshot(&w, root, root).unwrap();

        let ids = snap.object_ids();
        assert_eq!(ids[0], root);
        assert!(ids.contains(&hull));
        assert!(ids.contains(&cargo));
        assert!(!ids.contains(&other));
        assert!(!ids.contains(&asset));
        assert_eq!(snap.requested_id(), Some(root));
        assert_eq!(snap.paths.len(), 1);
        assert!(!snap.is_delta());
    }

    #[test]
    fn round_trip_preserves_ids_and_reference_shape() {
        let mut sender = world(1);
        let (root, hull, cargo, other, asset) = linked_graph(&mut sender);
        let snap = snapshot(&sender, root, root).unwrap();

        let mut receiver = world(2);
        // Asset content is loaded identically everywhere.
        let pkg = receiver.spawn(KindTag::GENERIC, "content", None, true).unwrap();
        let mesh = receiver.spawn(KindTag::GENERIC, "mesh", Some(pkg), true).unwrap();
        assert_eq!(mesh, asset);

        let result = deserialize(&mut receiver, &snap).unwrap();
        assert_eq!(result.requested, root);
        assert_eq!(result.objects.len(), 3);

        for id in [root, hull, cargo] {
            let a = sender.objects.get(id).unwrap();
            let b = receiver.objects.get(id).unwrap();
            assert_eq!(a.fields, b.fields, "fields of {id}");
            assert_eq!(a.outer, b.outer);
            assert_eq!(a.name, b.name);
        }
        // Unrelated reference left a stub behind.
        assert!(receiver.registry.stub(other).is_some());
        assert!(receiver.registry.is_remote(other));
    }

    #[test]
    fn path_refs_resolve_by_name_on_the_receiver() {
        let mut sender = world(1);
        let (root, _, _, _, asset) = linked_graph(&mut sender);
        let snap = snapshot(&sender, root, root).unwrap();

        let mut receiver = world(2);
        // Same names, different load order: ids differ, names still match.
        receiver.spawn(KindTag::GENERIC, "unrelated", None, true).unwrap();
        let pkg = receiver.spawn(KindTag::GENERIC, "content", None, true).unwrap();
        let mesh = receiver.spawn(KindTag::GENERIC, "mesh", Some(pkg), true).unwrap();
        assert_ne!(mesh, asset);

        deserialize(&mut receiver, &snap).unwrap();
        let got = receiver.objects.get(root).unwrap().get("mesh").cloned();
        assert_eq!(got, Some(Value::Ref(Some(mesh))));
    }

    #[test]
    fn requested_object_is_always_present() {
        let mut w = world(1);
        let root = spawn(&mut w, "ship", None);
        let loose = spawn(&mut w, "loose", None);
        let snap = snapshot(&w, root, loose).unwrap();
        assert_eq!(snap.requested_id(), Some(loose));
        assert_eq!(snap.object_count(), 2);
    }

    #[test]
    fn transient_and_standalone_objects_stay_behind() {
        let mut w = world(1);
        let root = spawn(&mut w, "ship", None);
        let scratch = spawn(&mut w, "scratch", Some(root));
        let rider = spawn(&mut w, "rider", Some(root));
        w.objects.get_mut(scratch).unwrap().flags.insert(ObjectFlags::TRANSIENT);
        w.objects.get_mut(rider).unwrap().flags.insert(ObjectFlags::STANDALONE);
        set(&mut w, root, "rider", rider);

        let snap = snapshot(&w, root, root).unwrap();
        assert_eq!(snap.object_ids(), vec![root]);
        assert!(snap.ids.contains(&rider));
    }

    #[test]
    fn existing_objects_are_reused() {
        let mut sender = world(1);
        let (root, ..) = linked_graph(&mut sender);
        let snap = snapshot(&sender, root, root).unwrap();

        let mut receiver = world(2);
        deserialize(&mut receiver, &snap).unwrap();
        let count = receiver.objects.len();
        set(&mut receiver, root, "hp", 3i64);
        deserialize(&mut receiver, &snap).unwrap();
        assert_eq!(receiver.objects.len(), count);
        assert_eq!(receiver.objects.get(root).unwrap().get("hp"), Some(&Value::Int(100)));
    }

    #[test]
    fn pending_kill_objects_are_rebuilt() {
        let mut sender = world(1);
        let root = spawn(&mut sender, "ship", None);
        set(&mut sender, root, "hp", 5i64);
        let snap = snapshot(&sender, root, root).unwrap();

        let mut receiver = world(2);
        deserialize(&mut receiver, &snap).unwrap();
        let stale = receiver.objects.get_mut(root).unwrap();
        stale.flags.insert(ObjectFlags::PENDING_KILL);
        stale.set("junk", true);

        deserialize(&mut receiver, &snap).unwrap();
        let rebuilt = receiver.objects.get(root).unwrap();
        assert!(!rebuilt.flags.contains(ObjectFlags::PENDING_KILL));
        assert_eq!(rebuilt.get("junk"), None);
    }

    #[test]
    fn unknown_kinds_are_skipped_unless_requested() {
        let mut sender = world(1);
        let root = spawn(&mut sender, "ship", None);
        let odd = sender.spawn(CRATE_KIND, "odd", Some(root), false).unwrap();
        let snap = snapshot(&sender, root, root).unwrap();

        let mut receiver = World::new(ServerId::new(2), KindRegistry::new());
        let result = deserialize(&mut receiver, &snap).unwrap();
        assert_eq!(result.objects, vec![root]);
        assert!(!receiver.objects.contains(odd));

        let snap = snapshot(&sender, root, odd).unwrap();
        let mut receiver = World::new(ServerId::new(2), KindRegistry::new());
        assert!(matches!(
            deserialize(&mut receiver, &snap),
            Err(SerializationError::UnknownKind { .. })
        ));
    }

    #[test]
    fn corrupt_inner_is_skipped_and_left_out_of_the_arena() {
        let mut sender = world(1);
        let (root, hull, cargo, ..) = linked_graph(&mut sender);
        let mut snap = snapshot(&sender, root, root).unwrap();
        let position = snap.object_ids().iter().position(|&id| id == hull).unwrap();
        snap.chunks[position] = Bytes::from_static(b"not json");

        let mut receiver = world(2);
        let result = deserialize(&mut receiver, &snap).unwrap();
        assert!(!result.objects.contains(&hull));
        assert!(result.objects.contains(&cargo));
        assert!(!receiver.objects.contains(hull));
        // cargo still points at hull, so hull is known as a remote stub.
        assert!(receiver.registry.stub(hull).is_some());
    }

    #[test]
    fn failed_requested_object_leaves_nothing_behind() {
        let mut sender = world(1);
        let (root, ..) = linked_graph(&mut sender);
        let mut snap = snapshot(&sender, root, root).unwrap();
        snap.chunks[0] = Bytes::from_static(b"not json");

        let mut receiver = world(2);
        assert!(deserialize(&mut receiver, &snap).is_err());
        assert!(receiver.objects.is_empty());
    }

    #[test]
    fn delta_restores_prototype_state() {
        let mut w = world(1);
        let proto = spawn(&mut w, "ship_template", None);
        let proto_gun = spawn(&mut w, "gun", Some(proto));
        set(&mut w, proto, "hp", 100i64);
        set(&mut w, proto, "name", "frigate");
        set(&mut w, proto, "primary", proto_gun);
        set(&mut w, proto_gun, "ammo", 30i64);

        let ship = spawn(&mut w, "ship", None);
        let gun = spawn(&mut w, "gun", Some(ship));
        w.objects.get_mut(ship).unwrap().prototype = Some(proto);
        set(&mut w, ship, "hp", 12i64);
        set(&mut w, ship, "name", "frigate");
        set(&mut w, gun, "ammo", 2i64);
        set(&mut w, gun, "jammed", true);

        let delta = delta_snapshot(&w, proto, ship).unwrap();
        assert!(delta.is_delta());
        assert_eq!(delta.flags & SNAPSHOT_FLAG_DELTA, SNAPSHOT_FLAG_DELTA);
        assert_eq!(delta.object_ids(), vec![ship, gun]);
        // Only diverging fields travel: hp and primary on the ship, ammo on the gun.
        let ship_fields = decode_fields(&delta.chunks[0]).unwrap();
        assert_eq!(ship_fields.len(), 2);

        let result = deserialize(&mut w, &delta).unwrap();
        assert_eq!(result.requested, ship);
        let ship_obj = w.objects.get(ship).unwrap();
        assert_eq!(ship_obj.get("hp"), Some(&Value::Int(100)));
        assert_eq!(ship_obj.get("primary"), Some(&Value::Ref(Some(gun))));
        let gun_obj = w.objects.get(gun).unwrap();
        assert_eq!(gun_obj.get("ammo"), Some(&Value::Int(30)));
        assert_eq!(gun_obj.get("jammed"), None);
        // Prototype untouched.
        assert_eq!(w.objects.get(proto).unwrap().get("primary"), Some(&Value::Ref(Some(proto_gun))));
    }

    #[test]
    fn delta_on_missing_target_fails_for_requested() {
        let mut w = world(1);
        let proto = spawn(&mut w, "template", None);
        let ship = spawn(&mut w, "ship", None);
        set(&mut w, proto, "hp", 1i64);
        let delta = delta_snapshot(&w, proto, ship).unwrap();

        let mut other = world(2);
        assert!(matches!(
            deserialize(&mut other, &delta),
            Err(SerializationError::RequestedMissing(id)) if id == ship
        ));
    }

    #[test]
    fn framed_snapshot_survives_storage_encoding() {
        let mut w = world(1);
        let (root, ..) = linked_graph(&mut w);
        let snap = snapshot(&w, root, root).unwrap();
        let framed = snap.encode().unwrap();
        assert_eq!(GraphSnapshot::decode(&framed).unwrap(), snap);
    }
}
