//! IO state machine of a buffer read under directory ownership.
//!
//! A read goes through these steps:
//!
//! ```text
//!   Idle --start_buffer_io--> IO claimed --start_read_page--> remote requested
//!                                                               |        |
//!                                               terminate_read_page    rejected
//!                                                               |        |
//!                                                            loaded   abort_buffer_io, retry
//! ```
//!
//! The IO claim is the `IO_IN_PROGRESS` header bit plus the worker's
//! `in_progress_buf`. A worker that finds the claim taken by someone else drops
//! the header lock, sleeps on the slot's condition variable until that IO ends,
//! and then starts its attempt over.
//!
//! A rejected request leaves the claim in place. The caller must release any
//! content lock it holds, call [`BufferCoherence::abort_buffer_io`], and retry
//! the whole read.

use std::sync::Arc;

use fail::fail_point;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::CoherenceConf;
use crate::context::{ContextBuilder, NodeState, WorkerContext, WorkerId};
use crate::control_table::{ControlTable, CtrlState, HeaderFlags};
use crate::directory::{Directory, DirectoryError, EdpInfo, PageGrant};
use crate::lock_mode::{BufLockMode, lock_mode_compatible};
use crate::metrics::{IO_WAITS, PAGE_REQUESTS};
use crate::page::Page;
use crate::storage::{LocalStorage, ReadTarget, StorageError};
use crate::types::{BufferId, BufferTag, PhysicalBlock, ReadBufferMode};

#[derive(Debug, Error)]
pub enum ReadPageError {
    /// The directory did not grant ownership. The caller must release its
    /// content lock, abort the IO and retry the read from the top.
    #[error("page request rejected")]
    Rejected(#[source] DirectoryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ReadPageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReadPageError::Rejected(_))
    }
}

/// Call this when the local copy of a page contradicts storage. Unwinding would
/// only end the calling worker and leave its IO claim held, so the process is
/// aborted.
fn on_fatal_consistency_error(msg: std::fmt::Arguments<'_>) -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    error!("Fatal consistency error: {msg}\n{backtrace}");
    std::process::abort();
}

pub struct BufferCoherence<'t, D: Directory + ?Sized, S: LocalStorage + ?Sized> {
    pub(crate) table: &'t ControlTable,
    pub(crate) node: Arc<NodeState>,
    pub(crate) directory: Arc<D>,
    pub(crate) storage: Arc<S>,
    pub(crate) contexts: ContextBuilder,
    verify_page_lsn: bool,
}

impl<'t, D: Directory + ?Sized, S: LocalStorage + ?Sized> BufferCoherence<'t, D, S> {
    pub fn new(
        conf: &CoherenceConf,
        table: &'t ControlTable,
        node: Arc<NodeState>,
        directory: Arc<D>,
        storage: Arc<S>,
    ) -> Self {
        BufferCoherence {
            table,
            node,
            directory,
            storage,
            contexts: ContextBuilder::new(conf.instance_id, conf.total_procs),
            verify_page_lsn: conf.verify_page_lsn,
        }
    }

    pub fn table(&self) -> &'t ControlTable {
        self.table
    }

    pub fn node(&self) -> &NodeState {
        &self.node
    }

    fn worker_id(&self, worker: &WorkerContext) -> WorkerId {
        WorkerId(worker.session_id(self.contexts.total_procs))
    }

    /// Read a relation page, acquiring ownership in `mode` first if the cached
    /// ownership does not already cover it.
    pub fn read_page(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        mode: BufLockMode,
        read_mode: ReadBufferMode,
    ) -> Result<BufferId, ReadPageError> {
        let ctrl = self.table.get(buf);
        if ctrl.state.contains(CtrlState::IS_RELPERSISTENT_TEMP) {
            return Ok(buf);
        }
        let pblk = ctrl.pblk;

        if !self.start_buffer_io(worker, buf, mode) {
            return Ok(buf);
        }
        self.start_read_page(worker, buf, mode)
            .map_err(ReadPageError::Rejected)?;
        self.terminate_read_page(worker, buf, read_mode, pblk)
    }

    /// Read a segment metadata page.
    pub fn read_seg_page(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        mode: BufLockMode,
        read_mode: ReadBufferMode,
    ) -> Result<BufferId, ReadPageError> {
        let ctrl = self.table.get(buf);
        if ctrl.state.contains(CtrlState::IS_RELPERSISTENT_TEMP) {
            return Ok(buf);
        }

        if !self.start_buffer_io(worker, buf, mode) {
            return Ok(buf);
        }
        self.start_read_page(worker, buf, mode)
            .map_err(ReadPageError::Rejected)?;
        self.terminate_read_seg_page(worker, buf, read_mode)
    }

    /// Claim the IO on `buf` for a `mode` access.
    ///
    /// Returns false when no new IO is needed: the worker already holds the
    /// claim, or the cached ownership covers `mode`, possibly because a
    /// concurrent IO that we waited for has just granted it.
    pub fn start_buffer_io(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        mode: BufLockMode,
    ) -> bool {
        debug_assert!(
            worker.in_progress_buf.is_none() || worker.in_progress_buf == Some(buf),
            "worker already has IO in progress on buffer {:?}",
            worker.in_progress_buf
        );
        if worker.in_progress_buf == Some(buf) {
            return false;
        }

        let slot = self.table.slot(buf);
        let cached = slot.ctrl.lock().lock_mode;
        if lock_mode_compatible(cached, mode)
            && !slot.header.lock().flags.contains(HeaderFlags::IO_IN_PROGRESS)
        {
            return false;
        }

        let mut header = slot.header.lock();
        while header.flags.contains(HeaderFlags::IO_IN_PROGRESS) {
            IO_WAITS.inc();
            slot.io_done.wait(&mut header);
        }

        if lock_mode_compatible(slot.ctrl.lock().lock_mode, mode) {
            return false;
        }

        header.flags.insert(HeaderFlags::IO_IN_PROGRESS);
        header.io_owner = Some(self.worker_id(worker));
        drop(header);

        worker.in_progress_buf = Some(buf);
        worker.is_for_input = true;
        true
    }

    /// Ask the directory for ownership of `buf` in `mode`, and apply the grant
    /// to the control block.
    pub fn start_read_page(
        &self,
        worker: &WorkerContext,
        buf: BufferId,
        mode: BufLockMode,
    ) -> Result<(), DirectoryError> {
        let tag = self.storage.buffer_tag(buf);
        let ctx = self.contexts.build_for_page(worker, &tag);
        let ctrl = self.table.get(buf);
        let mode_label: &'static str = mode.into();

        fail_point!("page-coherence-request-page", |_| {
            PAGE_REQUESTS.with_label_values(&[mode_label, "error"]).inc();
            Err(DirectoryError::Rejected)
        });

        match self.directory.request_page(&ctx, &ctrl, mode) {
            Ok(grant) => {
                PAGE_REQUESTS
                    .with_label_values(&[mode_label, "success"])
                    .inc();
                self.apply_grant(buf, mode, grant);
                Ok(())
            }
            Err(e) => {
                PAGE_REQUESTS.with_label_values(&[mode_label, "error"]).inc();
                debug!("page request for {tag} in {mode:?} mode failed: {e}");
                Err(e)
            }
        }
    }

    fn apply_grant(&self, buf: BufferId, mode: BufLockMode, grant: PageGrant) {
        self.table.update(buf, |ctrl| {
            ctrl.lock_mode = ctrl.lock_mode.max(mode);
            if grant.need_load {
                ctrl.state.insert(CtrlState::NEED_LOAD);
            } else {
                ctrl.state.insert(CtrlState::IS_LOADED);
            }
            ctrl.is_remote_dirty = grant.remote_dirty;
            // early-dirty state is whatever the latest grant says
            let edp = grant.edp.unwrap_or(EdpInfo { scn: 0, map: 0 });
            ctrl.is_edp = grant.edp.is_some();
            ctrl.edp_scn = edp.scn;
            ctrl.edp_map = edp.map;
        });
    }

    /// Finish a relation page read after ownership was granted.
    pub fn terminate_read_page(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        read_mode: ReadBufferMode,
        pblk: Option<PhysicalBlock>,
    ) -> Result<BufferId, ReadPageError> {
        self.terminate_read(worker, buf, read_mode, ReadTarget::Relation { pblk })
    }

    /// Finish a segment metadata page read after ownership was granted.
    pub fn terminate_read_seg_page(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        read_mode: ReadBufferMode,
    ) -> Result<BufferId, ReadPageError> {
        self.terminate_read(worker, buf, read_mode, ReadTarget::Segment)
    }

    fn terminate_read(
        &self,
        worker: &mut WorkerContext,
        buf: BufferId,
        read_mode: ReadBufferMode,
        target: ReadTarget,
    ) -> Result<BufferId, ReadPageError> {
        // Transient hints never outlive the read, whichever way it ends.
        let _clear_hints = scopeguard::guard((), |_| self.table.reset(buf, false));

        let ctrl = self.table.get(buf);
        let is_extend = ctrl.state.contains(CtrlState::IS_EXTEND);
        let tag = self.storage.buffer_tag(buf);
        let is_segment_page = target == ReadTarget::Segment;

        if ctrl.state.contains(CtrlState::NEED_LOAD) {
            if let Err(e) = self.storage.read_page(buf, &tag, read_mode, target) {
                self.terminate_buffer_io(worker, buf, false);
                return Err(e.into());
            }
            self.terminate_buffer_io(worker, buf, true);
        } else {
            let mut page = self.storage.page(buf).lock();
            if is_extend && !is_segment_page && !page.is_new() {
                self.zero_extended_page(&tag, &mut page);
            }

            page.set_checksum_inplace(tag.block_number);

            if self.verify_page_lsn
                && self.node.is_normal_primary()
                && read_mode == ReadBufferMode::Normal
                && !is_extend
                && !self.table.header_flags(buf).contains(HeaderFlags::VALID)
            {
                if let Err(e) = self.verify_not_stale(&tag, target, &page) {
                    drop(page);
                    self.terminate_buffer_io(worker, buf, false);
                    return Err(e.into());
                }
            }
            drop(page);

            self.terminate_buffer_io(worker, buf, true);

            if !is_segment_page
                && self.node.is_normal_primary()
                && !self.node.failover_triggered()
                && !self.node.recovery_in_progress()
            {
                self.cache_seg_location(buf, &tag);
            }
        }

        if read_mode.locks_after_read() && !self.storage.content_lock_held(worker, buf) {
            self.storage.lock_content_exclusive(worker, buf);
        }

        Ok(buf)
    }

    /// An extend request found a page that is not blank. If the block already
    /// exists in storage, two instances extended the same block; otherwise the
    /// page was handed over by the primary after it extended it and we start
    /// from zeros.
    fn zero_extended_page(&self, tag: &BufferTag, page: &mut Page) {
        let nblocks = self.storage.relation_nblocks(tag);
        if tag.block_number != nblocks {
            on_fatal_consistency_error(format_args!(
                "[{tag}] cannot extend a page that already exists (relation has {nblocks} blocks)"
            ));
        }
        debug!("[{tag}] extended page received from another instance is not empty, zeroing it");
        page.zero();
    }

    /// A page whose on-disk copy is newer than the copy we were handed must
    /// never be used.
    fn verify_not_stale(
        &self,
        tag: &BufferTag,
        target: ReadTarget,
        page: &Page,
    ) -> Result<(), StorageError> {
        let mut disk_page = Page::default();
        self.storage
            .read_page_for_verification(tag, target, &mut disk_page)?;
        let disk_lsn = disk_page.lsn();
        let mem_lsn = page.lsn();
        if disk_lsn > mem_lsn {
            on_fatal_consistency_error(format_args!(
                "[{tag}] memory lsn({mem_lsn}) is less than disk lsn({disk_lsn})"
            ));
        }
        Ok(())
    }

    fn cache_seg_location(&self, buf: BufferId, tag: &BufferTag) {
        if !tag.is_segment() {
            return;
        }
        let Some(loc) = self.storage.segment_location(tag) else {
            on_fatal_consistency_error(format_args!(
                "[{tag}] segment page has no physical location"
            ));
        };
        let Some(file_loc) = loc.to_file_location() else {
            on_fatal_consistency_error(format_args!(
                "[{tag}] invalid extent size {}",
                loc.extent_size
            ));
        };
        debug!(
            "buffer {buf} is a segment data page, segfileno {} segblkno {}",
            file_loc.seg_fileno, file_loc.seg_blockno
        );
        self.table.slot(buf).header.lock().seg_location = Some(file_loc);
    }

    /// End the IO claim held by `worker` and wake everyone waiting for it.
    fn terminate_buffer_io(&self, worker: &mut WorkerContext, buf: BufferId, valid: bool) {
        let slot = self.table.slot(buf);
        {
            let mut header = slot.header.lock();
            debug_assert!(header.flags.contains(HeaderFlags::IO_IN_PROGRESS));
            debug_assert_eq!(header.io_owner, Some(self.worker_id(worker)));
            header.flags.remove(HeaderFlags::IO_IN_PROGRESS);
            if valid {
                header.flags.insert(HeaderFlags::VALID);
                header.flags.remove(HeaderFlags::IO_ERROR);
            } else {
                header.flags.insert(HeaderFlags::IO_ERROR);
            }
            header.io_owner = None;
        }
        slot.io_done.notify_all();

        worker.in_progress_buf = None;
        worker.is_for_input = false;
    }

    /// Give up an IO claim after a rejected request. Does nothing if `worker`
    /// does not hold the claim on `buf`.
    pub fn abort_buffer_io(&self, worker: &mut WorkerContext, buf: BufferId) {
        if worker.in_progress_buf != Some(buf) {
            return;
        }
        self.terminate_buffer_io(worker, buf, false);
        self.table.reset(buf, false);
    }

    /// Release this instance's ownership of `buf`. Returns true if the
    /// directory no longer records us as an owner.
    pub fn release_owner(&self, worker: &WorkerContext, buf: BufferId) -> bool {
        let ctrl = self.table.get(buf);
        if ctrl.state.contains(CtrlState::IS_RELPERSISTENT_TEMP) {
            return true;
        }
        let tag = self.storage.buffer_tag(buf);
        let ctx = self.contexts.build_for_page(worker, &tag);
        match self.directory.release_ownership(&ctx, &ctrl) {
            Ok(true) => {
                self.table
                    .update(buf, |ctrl| ctrl.lock_mode = BufLockMode::Null);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("failed to release ownership of {tag}: {e}");
                false
            }
        }
    }
}
