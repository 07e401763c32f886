//! Session memory
//!
//! One conversational-history contract over two backends:
//! - `remote`: durable memory service (HTTP)
//! - `local`: in-process fallback buffers
//! - `manager`: per-session mode tracking, fallback and reconciliation

mod local;
pub mod manager;
pub mod remote;
pub mod types;

pub use local::LocalFallbackStore;
pub use manager::{MemoryOptions, SessionMemoryManager};
pub use remote::{HttpRemoteMemory, RemoteMemory};
pub use types::{
    merge_histories, reconcile_buffer, BackendMode, MemoryStats, NewTurn, Session, SessionId, Turn,
};
