//! Ferry integration test harness.
//!
//! Every test builds an in-process fleet of servers that talk through a
//! deterministic router (see `infra.rs`). Nothing touches the network; the
//! store tests use a temp directory per test.
//!
//!   cargo test --test integration

mod infra;

mod commit;
mod executor;
mod migration;
mod serializer;
mod store;

pub use infra::*;
