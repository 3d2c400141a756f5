//! Call contract of the remote ownership directory.
//!
//! The directory itself (membership, consensus, replication) lives elsewhere.
//! All calls are synchronous and block for at most the timeout they are given,
//! or the directory's own per-call timeout.

use std::time::Duration;

use thiserror::Error;

use crate::context::RequestContext;
use crate::control_table::BufferCtrl;
use crate::lock_mode::BufLockMode;
use crate::types::Lsn;

/// Anything other than success from a directory call. Callers treat all kinds
/// as recoverable and surface them unchanged unless stated otherwise.
#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum DirectoryError {
    #[error("directory request failed")]
    Failed,
    #[error("directory request timed out")]
    Timeout,
    #[error("directory is busy")]
    Busy,
    #[error("cluster reform in progress")]
    ReformInProgress,
    #[error("request rejected by the directory")]
    Rejected,
    #[error("directory error code {0}")]
    Other(i32),
}

/// Early-dirty-page bookkeeping reported with a grant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EdpInfo {
    pub scn: u64,
    pub map: u64,
}

/// Outcome of a successful page request.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PageGrant {
    /// The page was not transferred from another instance and has to be read
    /// from shared storage.
    pub need_load: bool,
    /// Another instance holds unflushed changes to the page.
    pub remote_dirty: bool,
    pub edp: Option<EdpInfo>,
}

/// How the directory should treat a DDL lock request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum LockRequestKind {
    Normal = 0,
    ReleaseSelf = 1,
    /// Restores a lock held before a reform instead of contending for it.
    Reacquire = 2,
}

pub trait Directory: Send + Sync {
    /// Ask for ownership of a page in `mode`. On success the page content has
    /// been transferred into the local buffer unless the grant says it must be
    /// loaded from storage.
    fn request_page(
        &self,
        ctx: &RequestContext,
        ctrl: &BufferCtrl,
        mode: BufLockMode,
    ) -> Result<PageGrant, DirectoryError>;

    /// Give up ownership. Returns whether the ownership was actually released.
    fn release_ownership(
        &self,
        ctx: &RequestContext,
        ctrl: &BufferCtrl,
    ) -> Result<bool, DirectoryError>;

    /// Re-register ownership of a page after failover or reform.
    fn rebuild_ownership(
        &self,
        ctx: &RequestContext,
        ctrl: &BufferCtrl,
        lsn: Lsn,
        is_dirty: bool,
    ) -> Result<(), DirectoryError>;

    /// Deliver `payload` to every other instance.
    fn broadcast(
        &self,
        ctx: &RequestContext,
        payload: &[u8],
        flush: bool,
        timeout: Duration,
        kind: LockRequestKind,
    ) -> Result<(), DirectoryError>;
}
