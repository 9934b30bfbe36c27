//! ferry-services — object world, serializer, transactional executor,
//! migration arbitration, multi-server commits and the durable store.

pub mod channel;
pub mod commit;
pub mod executor;
pub mod object;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod store;
pub mod transfer;
pub mod txn;
pub mod world;

pub use channel::{InboundSource, PeerSender};
pub use commit::{CommitCoordinator, CommitRole};
pub use executor::{Executor, UnitState, WorkUnit};
pub use object::{KindInfo, KindRegistry, KindTag, Object, ObjectFlags, Value};
pub use registry::{ObjectStub, Registry};
pub use serializer::SerializationError;
pub use server::{EngineError, Server, ServerStatus};
pub use store::{DatabasePeer, SnapshotStore};
pub use transfer::{PendingMigrationRequest, TransferQueue};
pub use txn::{work, Abort, Txn, WorkFn};
pub use world::World;
