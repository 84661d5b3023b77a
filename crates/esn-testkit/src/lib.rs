//! esn-testkit
//!
//! Deterministic backends for driving the liveness-and-release core without
//! Postgres or wall time: an in-memory store and queue with the production
//! semantics, a manual clock, sequential tokens, and recording transports.
//! The `Harness` wires them to the real scheduler and worker handlers.

mod clock;
mod harness;
mod mailbox;
mod queue;
mod store;
mod tokens;

pub use clock::ManualClock;
pub use harness::{t0, Harness, BASE_URL};
pub use mailbox::MemoryMailbox;
pub use queue::MemoryQueue;
pub use store::MemoryStore;
pub use tokens::SequentialTokens;
