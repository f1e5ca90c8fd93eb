/// threadsync - conversation-list synchronization engine
///
/// Keeps a client-side, ordered list of conversations consistent with a
/// server that streams unordered, duplicated and out-of-order events over a
/// connection that can drop at any time.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod recalc;
pub mod pin_ranking;
pub mod pin_store;
pub mod sort_policy;
pub mod presentation;
pub mod invariants;
pub mod store;
pub mod batcher;
pub mod fetcher;
pub mod coordinator;
pub mod engine;

pub use error::{Result, SyncError};
pub use config::SyncConfig;
pub use engine::{EngineHandle, EngineSnapshot, SyncEngine};
pub use store::{ConversationStore, ListScope};
