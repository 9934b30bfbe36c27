//! Ferry wire protocol — the messages peers exchange.
//!
//! These types ARE the protocol that sits above the peer channel. The
//! channel itself (sockets, framing, retransmission) is somebody else's
//! problem: every message here is fire-and-forget with at-most-once
//! delivery, and the protocol recovers from loss only through the
//! executor's abort/retry loop.
//!
//! Messages are a serde-tagged enum so any transport can carry them as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::{ObjectId, ServerId, TransactionId, WorkPriority};
use crate::snapshot::GraphSnapshot;

// ── Migration vocabulary ──────────────────────────────────────────────────────

/// What a requester wants from a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationIntent {
    /// Residency only; ownership stays where it is.
    #[default]
    Borrow,
    /// Residency and ownership move to the requester.
    TakeOwnership,
}

/// A best-known location for an object, ordered by `serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidentHint {
    pub server: ServerId,
    pub serial: u64,
}

/// Metadata that travels with every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMetadata {
    /// The object the requester asked for (may be an inner of the root).
    pub requested: ObjectId,
    pub sender: ServerId,
    /// Owner after the transfer.
    pub new_owner: ServerId,
    /// Owner before the transfer.
    pub owner_before: ServerId,
    pub intent: MigrationIntent,
}

// ── Multi-server commit vocabulary ────────────────────────────────────────────

/// Identifies one attempt of one multi-server commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId {
    pub initiator: ServerId,
    pub transaction: TransactionId,
    pub attempt: u32,
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.initiator, self.transaction, self.attempt)
    }
}

/// What a successful commit does to the borrowed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// The initiator only needed a consistent view; ownership is unchanged.
    #[default]
    Snapshot,
    /// The initiator needs final authority; ownership moves to it.
    TransferAuthority,
}

/// A participant's view of one touched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub object: ObjectId,
    /// Participant's last known serial for the object.
    pub serial: u64,
    pub owner: ServerId,
}

/// Why a commit was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitAbortReason {
    /// Participant is servicing an equal-or-higher priority commit.
    Denied,
    /// Participant was pre-empted by a higher-priority commit.
    Preempted,
    /// Initiator gave up (another participant refused, timeout, stale state).
    InitiatorAborted,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Every message a peer can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Ask the recipient to send (or forward the request for) an object.
    RequestObject {
        object: ObjectId,
        requester: ServerId,
        priority: WorkPriority,
        intent: MigrationIntent,
        last_known_resident: ServerId,
    },
    /// The recipient's request for `object` can not be served by the sender.
    DenyRequest {
        object: ObjectId,
        requester: ServerId,
        resident_hint: Option<ResidentHint>,
    },
    /// An object closure is being delivered.
    Snapshot {
        snapshot: GraphSnapshot,
        metadata: MigrationMetadata,
    },
    /// Persist a closure (sent to the Database peer).
    StoreSnapshot {
        object: ObjectId,
        snapshot: GraphSnapshot,
    },
    Begin {
        commit: CommitId,
        priority: WorkPriority,
        objects: Vec<ObjectId>,
        mode: CommitMode,
    },
    Ready {
        commit: CommitId,
        states: Vec<ObjectState>,
    },
    Abort {
        commit: CommitId,
        reason: CommitAbortReason,
    },
    Commit {
        commit: CommitId,
    },
    /// Deferred remote procedure request: run a registered function as work.
    Invoke {
        function: String,
        args: serde_json::Value,
        priority: WorkPriority,
    },
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::RequestObject { .. } => "request_object",
            PeerMessage::DenyRequest { .. } => "deny_request",
            PeerMessage::Snapshot { .. } => "snapshot",
            PeerMessage::StoreSnapshot { .. } => "store_snapshot",
            PeerMessage::Begin { .. } => "begin",
            PeerMessage::Ready { .. } => "ready",
            PeerMessage::Abort { .. } => "abort",
            PeerMessage::Commit { .. } => "commit",
            PeerMessage::Invoke { .. } => "invoke",
        }
    }
}

/// A message plus its routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ServerId,
    pub to: ServerId,
    pub message: PeerMessage,
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Consecutive aborts between two livelock diagnostics.
pub const LIVELOCK_REPORT_INTERVAL: u32 = 200;

/// Default time an initiator waits for every participant to be ready.
pub const COMMIT_TIMEOUT_MS: u64 = 5000;

/// How many closed commit ids a server remembers for late messages.
pub const CLOSED_COMMIT_MEMORY: usize = 256;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad snapshot magic: {}", hex::encode(.0))]
    BadMagic([u8; 4]),

    #[error("unknown snapshot version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("snapshot body hash mismatch")]
    HashMismatch,

    #[error("frame counts disagree with body")]
    CountMismatch,

    #[error("malformed body: {0}")]
    Body(String),

    #[error("snapshot body of {0} bytes does not fit a frame")]
    TooLarge(usize),
}
