//!
//! Buffer-cache coherence bridge for a shared-storage cluster.
//!
//! Several compute instances share one storage pool. Before an instance may use
//! a cached page it must own it, at the right strength, in the remote ownership
//! directory. This crate holds the per-buffer control blocks that record that
//! ownership, drives the IO state machine that turns a remote grant into a
//! usable page, re-registers ownership after failover, and broadcasts
//! cluster-wide DDL locks.
//!
//! Main parts:
//! - [`control_table`]: the process-wide array of buffer control blocks
//! - [`buffer_io`]: claiming local IO, requesting ownership, finalizing pages
//! - [`rebuild`]: ownership re-registration during failover and reform
//! - [`ddl_lock`]: the DDL lock broadcast protocol
//!
//! The remote directory and the local page store are collaborators, see
//! [`directory::Directory`] and [`storage::LocalStorage`].
//!

pub mod buffer_io;
pub mod config;
pub mod context;
pub mod control_table;
pub mod ddl_lock;
pub mod directory;
pub mod lock_mode;
pub mod lock_table;
pub mod logging;
pub mod metrics;
pub mod page;
pub mod rebuild;
pub mod storage;
pub mod types;

pub use buffer_io::{BufferCoherence, ReadPageError};
pub use config::CoherenceConf;
pub use context::{ContextBuilder, NodeState, RequestContext, WorkerContext};
pub use control_table::ControlTable;
pub use ddl_lock::DdlLockBroadcaster;
pub use directory::{Directory, DirectoryError};
pub use lock_mode::{BufLockMode, lock_mode_compatible};
pub use types::{BufferId, BufferTag, Lsn};

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_INSTANCE_ID: u8 = 0;
    /// Size of the proc logical-thread-id range. Threads without a proc get
    /// session ids above it.
    pub const DEFAULT_TOTAL_PROCS: u32 = 1024;
    pub const DEFAULT_BUFFER_COUNT: usize = 16384;

    pub const DEFAULT_DDL_LOCK_RETRY_COUNT: u32 = 3;
    pub const DEFAULT_DDL_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);
    pub const DEFAULT_DDL_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_DDL_LOCK_NOWAIT_TIMEOUT: Duration = Duration::from_micros(5);
}
