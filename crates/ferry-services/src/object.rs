//! Object arena and kind table.
//!
//! Objects live in an arena keyed by `ObjectId`. Containment is a parent
//! pointer (`outer`); references between objects are ids stored in field
//! values. Nothing here holds a pointer to another object, so cycles are
//! just ids.
//!
//! The set of constructible kinds is closed: a receiver can only build an
//! object whose kind tag has been registered with its `KindRegistry`.

use std::collections::{BTreeMap, HashMap};

use ferry_core::migration::MigrationContext;
use ferry_core::ObjectId;
use serde::{Deserialize, Serialize};

// ── Values ────────────────────────────────────────────────────────────────────

/// A field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Strong reference to another object.
    Ref(Option<ObjectId>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(r) => *r,
            _ => None,
        }
    }

    /// Append every object this value refers to.
    pub fn collect_refs(&self, out: &mut Vec<ObjectId>) {
        match self {
            Value::Ref(Some(id)) => out.push(*id),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Ref(Some(v))
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Lifecycle flags carried in object headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    pub const NONE: ObjectFlags = ObjectFlags(0);
    /// Being torn down; never reused by the deserializer.
    pub const PENDING_KILL: ObjectFlags = ObjectFlags(0x1);
    /// Migrates on its own even when it has an outer.
    pub const STANDALONE: ObjectFlags = ObjectFlags(0x2);
    /// Never written into a snapshot.
    pub const TRANSIENT: ObjectFlags = ObjectFlags(0x4);

    pub const fn from_bits(bits: u32) -> Self {
        ObjectFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ObjectFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ObjectFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ObjectFlags) {
        self.0 &= !other.0;
    }
}

// ── Kinds ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindTag(pub u16);

impl KindTag {
    /// Plain bag of fields, registered on every peer.
    pub const GENERIC: KindTag = KindTag(0);
}

/// Called on both sides of a transfer, after the object is in place.
pub type PostMigrateHook = fn(&mut Object, &MigrationContext);

/// A constructible kind.
#[derive(Clone)]
pub struct KindInfo {
    pub tag: KindTag,
    pub name: &'static str,
    /// Field values a freshly constructed instance starts with.
    pub defaults: fn() -> BTreeMap<String, Value>,
    pub post_migrate: Option<PostMigrateHook>,
}

impl std::fmt::Debug for KindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindInfo")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("post_migrate", &self.post_migrate.is_some())
            .finish()
    }
}

/// Registered kinds, keyed by tag.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: HashMap<KindTag, KindInfo>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(KindInfo {
            tag: KindTag::GENERIC,
            name: "generic",
            defaults: BTreeMap::new,
            post_migrate: None,
        });
        registry
    }

    /// Register or replace a kind.
    pub fn register(&mut self, info: KindInfo) {
        self.kinds.insert(info.tag, info);
    }

    pub fn get(&self, tag: KindTag) -> Option<&KindInfo> {
        self.kinds.get(&tag)
    }

    pub fn contains(&self, tag: KindTag) -> bool {
        self.kinds.contains_key(&tag)
    }

    /// Build a fresh instance. `None` for unregistered kinds.
    pub fn construct(
        &self,
        tag: KindTag,
        id: ObjectId,
        name: &str,
        outer: Option<ObjectId>,
    ) -> Option<Object> {
        let info = self.kinds.get(&tag)?;
        Some(Object {
            id,
            name: name.to_string(),
            kind: tag,
            outer,
            prototype: None,
            flags: ObjectFlags::NONE,
            fields: (info.defaults)(),
        })
    }
}

// ── Objects ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub id: ObjectId,
    pub name: String,
    pub kind: KindTag,
    /// Logical container.
    pub outer: Option<ObjectId>,
    /// Object this one was instantiated from.
    pub prototype: Option<ObjectId>,
    pub flags: ObjectFlags,
    pub fields: BTreeMap<String, Value>,
}

impl Object {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    /// Strong references held in fields, in field order.
    pub fn references(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.collect_refs(&mut out);
        }
        out
    }
}

/// All objects whose memory is resident on this peer.
#[derive(Debug, Clone, Default)]
pub struct ObjectArena {
    objects: BTreeMap<ObjectId, Object>,
}

impl ObjectArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: Object) -> Option<Object> {
        self.objects.insert(object.id, object)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Direct inners of `outer`, in id order.
    pub fn inners_of(&self, outer: ObjectId) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.outer == Some(outer))
            .map(|o| o.id)
            .collect()
    }

    /// Find a resident object by name within a container.
    pub fn find_by_name(&self, outer: Option<ObjectId>, name: &str) -> Option<ObjectId> {
        self.objects
            .values()
            .find(|o| o.outer == outer && o.name == name)
            .map(|o| o.id)
    }

    /// `id` followed by every resident container above it, innermost first.
    /// Stops at the first container that is not resident.
    pub fn outer_chain(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if chain.contains(&cur) {
                break;
            }
            chain.push(cur);
            current = self.objects.get(&cur).and_then(|o| o.outer);
        }
        chain
    }

    /// True if `root` appears in the outer chain of `id` (or is `id`).
    pub fn is_within(&self, id: ObjectId, root: ObjectId) -> bool {
        self.outer_chain(id).contains(&root)
    }
}
