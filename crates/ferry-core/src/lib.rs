//! ferry-core — identifiers, wire messages, snapshot format and configuration.
//! All other Ferry crates depend on this one.

pub mod config;
pub mod id;
pub mod migration;
pub mod snapshot;
pub mod wire;

pub use id::{IdGenerator, ObjectId, ServerId, TransactionId, WorkDepth, WorkPriority};
pub use migration::{MigrationContext, MigrationSide, RecvType, SendType};
pub use snapshot::GraphSnapshot;
pub use wire::{Envelope, MigrationIntent, PeerMessage};
