//! Object registry — where every known object lives and who owns it.
//!
//! A stub is created the first time this peer learns about an object and
//! is kept for the registry's lifetime. Stubs are cheap; nothing collects
//! them. `resident` is a best-known value that may lag an in-flight
//! migration; `owner` is authoritative only while the object is resident
//! here.

use std::collections::HashMap;

use ferry_core::wire::ResidentHint;
use ferry_core::{ObjectId, ServerId};

/// Residency and ownership record for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStub {
    pub id: ObjectId,
    /// Logical container, if known.
    pub outer: Option<ObjectId>,
    pub name: String,
    /// Highest migration serial seen for this object.
    pub last_known_serial: u64,
    /// Peer believed to hold the object's memory.
    pub resident: ServerId,
    pub owner: ServerId,
    pub physics_authority: ServerId,
}

impl ObjectStub {
    /// Stub for an object we know nothing about except its id.
    fn seeded(id: ObjectId) -> Self {
        let origin = id.server_id();
        Self {
            id,
            outer: None,
            name: String::new(),
            last_known_serial: 0,
            resident: origin,
            owner: origin,
            physics_authority: origin,
        }
    }

    pub fn hint(&self) -> ResidentHint {
        ResidentHint {
            server: self.resident,
            serial: self.last_known_serial,
        }
    }
}

/// The registry. Mutated only by committed effects and the message pump.
#[derive(Debug, Clone)]
pub struct Registry {
    local: ServerId,
    stubs: HashMap<ObjectId, ObjectStub>,
}

impl Registry {
    pub fn new(local: ServerId) -> Self {
        Self {
            local,
            stubs: HashMap::new(),
        }
    }

    pub fn local(&self) -> ServerId {
        self.local
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn stub(&self, id: ObjectId) -> Option<&ObjectStub> {
        self.stubs.get(&id)
    }

    /// Idempotent. An existing stub only takes the hint if it is newer.
    pub fn find_or_create_stub(&mut self, id: ObjectId, hint: Option<ResidentHint>) -> &ObjectStub {
        let stub = self.stubs.entry(id).or_insert_with(|| ObjectStub::seeded(id));
        if let Some(hint) = hint {
            if hint.server.is_valid() && hint.serial >= stub.last_known_serial {
                stub.resident = hint.server;
                stub.last_known_serial = hint.serial;
            }
        }
        stub
    }

    /// Record an object created here.
    pub fn register_local(&mut self, id: ObjectId, name: &str, outer: Option<ObjectId>) {
        let local = self.local;
        let owner = if id.is_asset() { ServerId::ASSET } else { local };
        let stub = self.stubs.entry(id).or_insert_with(|| ObjectStub::seeded(id));
        stub.name = name.to_string();
        stub.outer = outer;
        stub.resident = local;
        stub.owner = owner;
        stub.physics_authority = local;
    }

    /// Record that an object's memory arrived here.
    pub fn mark_arrived(
        &mut self,
        id: ObjectId,
        name: &str,
        outer: Option<ObjectId>,
        owner: ServerId,
        physics_authority: ServerId,
        serial: u64,
    ) {
        let local = self.local;
        let stub = self.stubs.entry(id).or_insert_with(|| ObjectStub::seeded(id));
        stub.name = name.to_string();
        stub.outer = outer;
        stub.resident = local;
        stub.owner = owner;
        stub.physics_authority = physics_authority;
        stub.last_known_serial = stub.last_known_serial.max(serial);
    }

    /// Record that an object's memory left for `destination`.
    pub fn mark_departed(&mut self, id: ObjectId, destination: ServerId, new_owner: ServerId, serial: u64) {
        let stub = self.stubs.entry(id).or_insert_with(|| ObjectStub::seeded(id));
        stub.resident = destination;
        stub.owner = new_owner;
        stub.last_known_serial = stub.last_known_serial.max(serial);
    }

    /// Next migration serial for an object about to leave.
    pub fn next_serial(&self, id: ObjectId) -> u64 {
        self.stubs.get(&id).map(|s| s.last_known_serial).unwrap_or(0) + 1
    }

    pub fn last_known_serial(&self, id: ObjectId) -> u64 {
        self.stubs.get(&id).map(|s| s.last_known_serial).unwrap_or(0)
    }

    /// True if the object is resident here, by the registry's account.
    pub fn is_resident(&self, id: ObjectId) -> bool {
        !self.is_remote(id)
    }

    /// True if the object's memory is not resident here.
    ///
    /// Without a stub the id's embedded server decides. Asset content is
    /// present everywhere and never remote.
    pub fn is_remote(&self, id: ObjectId) -> bool {
        if id.is_asset() {
            return false;
        }
        match self.stubs.get(&id) {
            Some(stub) => stub.resident != self.local,
            None => id.server_id() != self.local,
        }
    }

    pub fn is_owned_locally(&self, id: ObjectId) -> bool {
        match self.stubs.get(&id) {
            Some(stub) => {
                (stub.resident == self.local && stub.owner == self.local)
                    || stub.owner == ServerId::ASSET
            }
            None => id.is_asset() || id.server_id() == self.local,
        }
    }

    pub fn owner_of(&self, id: ObjectId) -> ServerId {
        match self.stubs.get(&id) {
            Some(stub) => stub.owner,
            None if id.is_asset() => ServerId::ASSET,
            None => id.server_id(),
        }
    }

    pub fn set_owner(&mut self, id: ObjectId, owner: ServerId) {
        self.stubs
            .entry(id)
            .or_insert_with(|| ObjectStub::seeded(id))
            .owner = owner;
    }

    pub fn resident_of(&self, id: ObjectId) -> ServerId {
        match self.stubs.get(&id) {
            Some(stub) => stub.resident,
            None if id.is_asset() => self.local,
            None => id.server_id(),
        }
    }

    pub fn physics_authority(&self, id: ObjectId) -> ServerId {
        self.stubs
            .get(&id)
            .map(|s| s.physics_authority)
            .unwrap_or_else(|| id.server_id())
    }

    pub fn set_physics_authority(&mut self, id: ObjectId, server: ServerId) {
        self.stubs
            .entry(id)
            .or_insert_with(|| ObjectStub::seeded(id))
            .physics_authority = server;
    }

    /// Every object whose memory is resident here and that we own.
    pub fn owned_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .stubs
            .values()
            .filter(|s| s.resident == self.local && s.owner == self.local)
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }
}
