//! The per-server object world: arena, registry, kind table and id space.
//!
//! One `World` per server, owned by its `Server` context. Fields are public
//! so the executor can lend the read-only parts to a transaction while
//! keeping the id generator mutable.

use ferry_core::{IdGenerator, ObjectId, ServerId};

use crate::object::{KindRegistry, KindTag, Object, ObjectArena, ObjectFlags};
use crate::registry::Registry;

#[derive(Debug)]
pub struct World {
    pub local: ServerId,
    pub objects: ObjectArena,
    pub registry: Registry,
    pub kinds: KindRegistry,
    pub ids: IdGenerator,
}

impl World {
    pub fn new(local: ServerId, kinds: KindRegistry) -> Self {
        Self {
            local,
            objects: ObjectArena::new(),
            registry: Registry::new(local),
            kinds,
            ids: IdGenerator::new(local),
        }
    }

    /// Create an object directly, outside any work unit.
    ///
    /// Used for bootstrapping content. Returns `None` for unregistered kinds.
    pub fn spawn(
        &mut self,
        kind: KindTag,
        name: &str,
        outer: Option<ObjectId>,
        is_asset: bool,
    ) -> Option<ObjectId> {
        let id = self.ids.generate(is_asset);
        let object = self.kinds.construct(kind, id, name, outer)?;
        self.insert_local(object);
        Some(id)
    }

    /// Insert an object created here and record it in the registry.
    pub fn insert_local(&mut self, object: Object) {
        self.registry
            .register_local(object.id, &object.name, object.outer);
        self.objects.insert(object);
    }

    /// The outermost container that migrates together with `id`.
    ///
    /// The walk stops at a standalone object, at an object with no outer,
    /// and before any outer that is asset content or not resident here.
    pub fn canonical_root(&self, id: ObjectId) -> ObjectId {
        let mut current = id;
        for _ in 0..=self.objects.len() {
            let Some(object) = self.objects.get(current) else {
                return current;
            };
            if object.flags.contains(ObjectFlags::STANDALONE) {
                return current;
            }
            match object.outer {
                Some(outer) if !outer.is_asset() && self.objects.contains(outer) => {
                    current = outer;
                }
                _ => return current,
            }
        }
        // Containment cycle; the arena is corrupt but the walk terminates.
        current
    }
}
