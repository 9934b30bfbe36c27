//! Migration classification.
//!
//! A pure function of who owned the object before the transfer, who owns
//! it after, and which side of the transfer we are on. Object hooks use the
//! result to decide whether to expect the object back.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::{ObjectId, ServerId};

/// Which end of a transfer the local peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationSide {
    Send,
    Receive,
}

/// Classification of an incoming object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecvType {
    /// We become owner and did not own it before.
    AssignedOwnership,
    /// We become owner and already owned it: our own object coming home.
    ReturnedLoan,
    /// Residency only.
    Borrowed,
}

/// Classification of an outgoing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendType {
    /// We own it and the destination becomes owner.
    ReassignOwnership,
    /// We do not own it and are sending it back to its owner.
    ReturnBorrowed,
    /// Residency only; ownership unchanged.
    Loan,
}

impl fmt::Display for RecvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecvType::AssignedOwnership => "assigned_ownership",
            RecvType::ReturnedLoan => "returned_loan",
            RecvType::Borrowed => "borrowed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendType::ReassignOwnership => "reassign_ownership",
            SendType::ReturnBorrowed => "return_borrowed",
            SendType::Loan => "loan",
        };
        f.write_str(s)
    }
}

/// Everything a hook needs to know about one object's transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub object: ObjectId,
    pub local: ServerId,
    /// The other end of the transfer.
    pub remote: ServerId,
    /// Owner after the transfer.
    pub requested_owner: ServerId,
    /// Owner before the transfer.
    pub owner_before: ServerId,
    pub side: MigrationSide,
}

impl MigrationContext {
    /// Context for an object the local peer is sending to `destination`.
    pub fn send(
        object: ObjectId,
        local: ServerId,
        destination: ServerId,
        requested_owner: ServerId,
        owner_before: ServerId,
    ) -> Self {
        Self {
            object,
            local,
            remote: destination,
            requested_owner,
            owner_before,
            side: MigrationSide::Send,
        }
    }

    /// Context for an object the local peer received from `sender`.
    pub fn receive(
        object: ObjectId,
        local: ServerId,
        sender: ServerId,
        requested_owner: ServerId,
        owner_before: ServerId,
    ) -> Self {
        Self {
            object,
            local,
            remote: sender,
            requested_owner,
            owner_before,
            side: MigrationSide::Receive,
        }
    }

    /// Receive classification. Meaningful on the receiving side only.
    pub fn recv_type(&self) -> RecvType {
        classify_receive(self.local, self.requested_owner, self.owner_before)
    }

    /// Send classification. Meaningful on the sending side only.
    pub fn send_type(&self) -> SendType {
        classify_send(self.local, self.remote, self.requested_owner, self.owner_before)
    }

    pub fn ownership_changes(&self) -> bool {
        self.requested_owner != self.owner_before
    }
}

pub fn classify_receive(local: ServerId, new_owner: ServerId, owner_before: ServerId) -> RecvType {
    if new_owner == local {
        if owner_before == local {
            RecvType::ReturnedLoan
        } else {
            RecvType::AssignedOwnership
        }
    } else {
        RecvType::Borrowed
    }
}

pub fn classify_send(
    local: ServerId,
    destination: ServerId,
    new_owner: ServerId,
    owner_before: ServerId,
) -> SendType {
    if owner_before == local && new_owner == destination {
        SendType::ReassignOwnership
    } else if owner_before != local && destination == owner_before {
        SendType::ReturnBorrowed
    } else {
        SendType::Loan
    }
}
