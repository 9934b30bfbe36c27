//! Peer channel — the abstract send/receive boundary.
//!
//! Everything leaving a server goes through a `PeerSender` as an
//! `Envelope` on an unbounded tokio channel; whoever holds the receiving
//! end (the daemon's router, or a test fleet) decides how it travels.
//! Delivery is fire-and-forget: a closed channel is logged and the message
//! is dropped, exactly like a lost packet.

use std::collections::VecDeque;

use ferry_core::wire::{
    CommitAbortReason, CommitId, CommitMode, MigrationIntent, MigrationMetadata, ObjectState,
    ResidentHint,
};
use ferry_core::{Envelope, GraphSnapshot, ObjectId, PeerMessage, ServerId, WorkPriority};
use tokio::sync::mpsc;

/// Outbound half of a server's peer channel.
#[derive(Debug, Clone)]
pub struct PeerSender {
    local: ServerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PeerSender {
    pub fn new(local: ServerId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { local, tx }
    }

    pub fn local(&self) -> ServerId {
        self.local
    }

    pub fn send(&self, to: ServerId, message: PeerMessage) {
        tracing::trace!(from = %self.local, to = %to, kind = message.kind(), "send");
        let envelope = Envelope {
            from: self.local,
            to,
            message,
        };
        if self.tx.send(envelope).is_err() {
            tracing::debug!(to = %to, "peer channel closed, message dropped");
        }
    }

    pub fn send_snapshot(&self, to: ServerId, snapshot: GraphSnapshot, metadata: MigrationMetadata) {
        self.send(to, PeerMessage::Snapshot { snapshot, metadata });
    }

    pub fn request_object(
        &self,
        to: ServerId,
        object: ObjectId,
        requester: ServerId,
        priority: WorkPriority,
        intent: MigrationIntent,
        last_known_resident: ServerId,
    ) {
        self.send(
            to,
            PeerMessage::RequestObject {
                object,
                requester,
                priority,
                intent,
                last_known_resident,
            },
        );
    }

    pub fn deny_request(&self, object: ObjectId, requester: ServerId, hint: Option<ResidentHint>) {
        self.send(
            requester,
            PeerMessage::DenyRequest {
                object,
                requester,
                resident_hint: hint,
            },
        );
    }

    pub fn begin(
        &self,
        to: ServerId,
        commit: CommitId,
        priority: WorkPriority,
        objects: Vec<ObjectId>,
        mode: CommitMode,
    ) {
        self.send(
            to,
            PeerMessage::Begin {
                commit,
                priority,
                objects,
                mode,
            },
        );
    }

    pub fn ready(&self, to: ServerId, commit: CommitId, states: Vec<ObjectState>) {
        self.send(to, PeerMessage::Ready { commit, states });
    }

    pub fn abort(&self, to: ServerId, commit: CommitId, reason: CommitAbortReason) {
        self.send(to, PeerMessage::Abort { commit, reason });
    }

    pub fn commit(&self, to: ServerId, commit: CommitId) {
        self.send(to, PeerMessage::Commit { commit });
    }
}

/// Inbound half: anything that can hand over the envelopes that have
/// arrived since the last pump, without blocking.
pub trait InboundSource {
    fn pump(&mut self) -> Vec<Envelope>;
}

impl InboundSource for mpsc::UnboundedReceiver<Envelope> {
    fn pump(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.try_recv() {
            out.push(envelope);
        }
        out
    }
}

impl InboundSource for VecDeque<Envelope> {
    fn pump(&mut self) -> Vec<Envelope> {
        self.drain(..).collect()
    }
}
