//! LizardFS client data plane.
//!
//! Turns POSIX reads and writes into sequences of network operations
//! against the right chunk parts: location discovery through the master
//! session, redundancy-aware read planning, wave-based plan execution with
//! on-the-fly recovery, a refcounted read cache and the chain-streaming
//! write coordinator.

pub mod chunkserver_stats;
pub use chunkserver_stats::ChunkserverStats;

pub mod connection_pool;
pub use connection_pool::{ChunkConnector, ConnectionPool};

pub mod read_plan;
pub use read_plan::{PlannedOperation, PostOp, ReadOperation, ReadPlan, RequestedPart};

pub mod read_planner;
pub use read_planner::{SliceReadPlanner, DEFAULT_BANDWIDTH_OVERUSE};

pub mod plan_executor;
pub use plan_executor::{ExecutorTimeouts, ReadPlanExecutor};

pub mod read_cache;
pub use read_cache::{CacheResult, ReadCache};

pub mod master_conn;
pub use master_conn::{ChunkLocation, MasterSession, MasterSessionOptions, WriteGrant};

pub mod chunk_reader;
pub use chunk_reader::{ChunkReader, ChunkReaderOptions};

pub mod chunk_writer;
pub use chunk_writer::{ChunkWriter, ChunkWriterOptions};
