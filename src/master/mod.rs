//! The metadata master: chunk lookup handlers, write locks, file locks and
//! the admin surface.

pub mod chunk_registry;
pub mod config;
pub mod file_locks;
pub mod server;

pub use chunk_registry::{ChunkRegistry, ChunkserverState, WriteLease, MASTER_VERSION};
pub use config::MasterConfig;
pub use file_locks::{FileLockManager, SetLockOutcome};
pub use server::{MasterServer, MasterState};
