//! Single-writer, message-driven state store.
//!
//! Producers dispatch actions into one FIFO queue. A single dispatch loop
//! reduces each action against the current snapshot, publishes the result
//! with an atomic pointer swap, and runs the listeners registered for the
//! action's type before moving on. Readers load the latest snapshot without
//! locking.
//!
//! Consumers define their domain by implementing `ActionLike` (a type tag),
//! `Reducer` (pure transitions) and, optionally, `Listener` (reactions). The
//! `json` module ships a ready-made document flavour with `SET_STATE`.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod json;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod store;
pub mod traits;

pub use bootstrap::{load_initial_state, load_initial_state_or_empty};
pub use config::{ListenerFailurePolicy, OverflowPolicy, QueueConfig, StopMode, StoreConfig};
pub use engine::{Commit, Receipt};
pub use error::{ListenerFailure, LoadError, StoreError};
pub use memory::{Invocation, MemoryListener};
pub use registry::{SubscriptionHandle, SubscriptionId};
pub use store::{Ack, LoopState, Store};
pub use traits::{ActionLike, FnListener, Listener, Reducer, Transition};
