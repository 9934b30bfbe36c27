//! Identity — server ids, object ids, transaction ids and work priorities.
//!
//! Every identifier here is a plain integer newtype. They cross the wire
//! as numbers and compare as numbers; the bit layouts below are part of the
//! protocol and must not change once peers are deployed.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── ServerId ──────────────────────────────────────────────────────────────────

/// Number of bits an `ObjectId` reserves for the allocating server.
pub const SERVER_ID_BITS: u32 = 10;

/// Number of bits an `ObjectId` reserves for the serial number.
pub const SERIAL_BITS: u32 = 64 - SERVER_ID_BITS;

/// Largest serial number an `ObjectId` can carry.
pub const MAX_SERIAL: u64 = (1 << SERIAL_BITS) - 1;

/// One peer in the fleet, or one of the reserved sentinels.
///
/// `0` is invalid/unassigned. The two highest values are reserved:
/// `ASSET` (content present identically on every peer, never migrated)
/// and `DATABASE` (the durable store, a peer of last resort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u16);

impl ServerId {
    pub const INVALID: ServerId = ServerId(0);
    pub const MAX: u16 = (1 << SERVER_ID_BITS) - 1;
    pub const ASSET: ServerId = ServerId(Self::MAX);
    pub const DATABASE: ServerId = ServerId(Self::MAX - 1);

    /// Build a peer id. Values outside the 10-bit range are masked.
    pub const fn new(raw: u16) -> Self {
        ServerId(raw & Self::MAX)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn is_asset(self) -> bool {
        self == Self::ASSET
    }

    pub fn is_database(self) -> bool {
        self == Self::DATABASE
    }

    /// An ordinary fleet member (not invalid, not a sentinel).
    pub fn is_peer(self) -> bool {
        self.is_valid() && !self.is_asset() && !self.is_database()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ServerId::INVALID => write!(f, "invalid"),
            ServerId::ASSET => write!(f, "asset"),
            ServerId::DATABASE => write!(f, "database"),
            ServerId(raw) => write!(f, "s{raw}"),
        }
    }
}

// ── ObjectId ──────────────────────────────────────────────────────────────────

/// Globally unique, migration-stable object identifier.
///
/// Layout: `serial << 10 | server`. The serial is scoped to the allocating
/// server, so two peers never produce the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new(server: ServerId, serial: u64) -> Self {
        debug_assert!(serial <= MAX_SERIAL);
        ObjectId((serial << SERVER_ID_BITS) | server.raw() as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        ObjectId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn serial(self) -> u64 {
        self.0 >> SERVER_ID_BITS
    }

    /// The server that allocated this id. Not necessarily its owner.
    pub fn server_id(self) -> ServerId {
        ServerId::new((self.0 & ServerId::MAX as u64) as u16)
    }

    pub fn is_asset(self) -> bool {
        self.server_id().is_asset()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.server_id(), self.serial())
    }
}

/// Allocates object ids from two independent counters.
///
/// Asset ids are stamped with `ServerId::ASSET` so every peer that loads the
/// same content in the same order agrees on them. Live ids carry the local
/// server id.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    local: ServerId,
    next_live: u64,
    next_asset: u64,
}

impl IdGenerator {
    pub fn new(local: ServerId) -> Self {
        Self {
            local,
            next_live: 1,
            next_asset: 1,
        }
    }

    pub fn local(&self) -> ServerId {
        self.local
    }

    /// Allocate the next id. Running out of serials is unrecoverable.
    pub fn generate(&mut self, is_asset_hint: bool) -> ObjectId {
        let (counter, server) = if is_asset_hint {
            (&mut self.next_asset, ServerId::ASSET)
        } else {
            (&mut self.next_live, self.local)
        };
        let serial = *counter;
        if serial > MAX_SERIAL {
            panic!("object id space exhausted for {server}");
        }
        *counter += 1;
        ObjectId::new(server, serial)
    }
}

// ── TransactionId ─────────────────────────────────────────────────────────────

/// Identifies one work unit on its originating server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ── WorkPriority ──────────────────────────────────────────────────────────────

const PRIORITY_DEPTH_BITS: u32 = 8;
const PRIORITY_TXN_BITS: u32 = 64 - SERVER_ID_BITS - PRIORITY_DEPTH_BITS;
const PRIORITY_TXN_MASK: u64 = (1 << PRIORITY_TXN_BITS) - 1;
const PRIORITY_DEPTH_MASK: u64 = (1 << PRIORITY_DEPTH_BITS) - 1;

/// Nesting level of a unit of work. Root work sits at `ROOT`; every
/// dependent level is one lower, so root work wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkDepth(pub u8);

impl WorkDepth {
    pub const ROOT: WorkDepth = WorkDepth(u8::MAX);

    pub fn nested(self) -> WorkDepth {
        WorkDepth(self.0.saturating_sub(1))
    }
}

/// `(root server, depth, root transaction)` packed into one integer.
///
/// Layout (high to low): 10 bits root server, 8 bits depth, 46 bits root
/// transaction. Ordering is the ordering of the packed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkPriority(u64);

impl WorkPriority {
    pub const NONE: WorkPriority = WorkPriority(0);

    pub fn new(root_server: ServerId, depth: WorkDepth, root_txn: TransactionId) -> Self {
        let packed = ((root_server.raw() as u64) << (PRIORITY_DEPTH_BITS + PRIORITY_TXN_BITS))
            | ((depth.0 as u64) << PRIORITY_TXN_BITS)
            | (root_txn.0 & PRIORITY_TXN_MASK);
        WorkPriority(packed)
    }

    /// Priority of fresh, top-level work started on `server`.
    pub fn root(server: ServerId, txn: TransactionId) -> Self {
        Self::new(server, WorkDepth::ROOT, txn)
    }

    /// Priority for work spawned on behalf of this work, one level deeper.
    pub fn dependent(self) -> Self {
        Self::new(self.root_server(), self.depth().nested(), self.root_transaction())
    }

    pub const fn from_raw(raw: u64) -> Self {
        WorkPriority(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn root_server(self) -> ServerId {
        ServerId::new((self.0 >> (PRIORITY_DEPTH_BITS + PRIORITY_TXN_BITS)) as u16)
    }

    pub fn depth(self) -> WorkDepth {
        WorkDepth(((self.0 >> PRIORITY_TXN_BITS) & PRIORITY_DEPTH_MASK) as u8)
    }

    pub fn root_transaction(self) -> TransactionId {
        TransactionId(self.0 & PRIORITY_TXN_MASK)
    }
}

impl fmt::Display for WorkPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.root_server(),
            self.depth().0,
            self.root_transaction()
        )
    }
}
