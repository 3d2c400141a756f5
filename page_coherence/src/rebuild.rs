//! Ownership re-registration after failover or reform.
//!
//! The new directory incarnation learns who owns what from the instances
//! themselves: each buffer that we hold ownership of is reported back, with
//! its page LSN and whether we hold unflushed changes. The retry policy is up
//! to the reform driver.

use tracing::debug;

use crate::buffer_io::BufferCoherence;
use crate::context::WorkerContext;
use crate::control_table::HeaderFlags;
use crate::directory::{Directory, DirectoryError};
use crate::lock_mode::BufLockMode;
use crate::metrics::{FAILOVER_INVALIDATIONS, REBUILD_REQUESTS, outcome};
use crate::storage::LocalStorage;
use crate::types::BufferId;

impl<D: Directory + ?Sized, S: LocalStorage + ?Sized> BufferCoherence<'_, D, S> {
    /// Report `buf` to the directory for rebuild.
    ///
    /// A buffer we hold no ownership of has nothing to report. During failover
    /// its contents cannot be trusted either, so it is invalidated.
    pub fn check_for_rebuild(
        &self,
        worker: &WorkerContext,
        buf: BufferId,
    ) -> Result<(), DirectoryError> {
        let ctrl = self.table.get(buf);
        debug_assert!(!ctrl.is_edp, "early dirty page {buf} in rebuild");

        if ctrl.lock_mode == BufLockMode::Null {
            if self.node.in_failover() {
                self.storage.invalidate_buffer(buf);
                self.table.reset(buf, true);
                FAILOVER_INVALIDATIONS.inc();
            }
            return Ok(());
        }

        let tag = self.storage.buffer_tag(buf);
        let ctx = self.contexts.build_for_page(worker, &tag);
        let is_dirty = self
            .table
            .header_flags(buf)
            .intersects(HeaderFlags::DIRTY | HeaderFlags::JUST_DIRTIED);
        let lsn = self.storage.page(buf).lock().lsn();

        let res = self.directory.rebuild_ownership(&ctx, &ctrl, lsn, is_dirty);
        REBUILD_REQUESTS.with_label_values(&[outcome(&res)]).inc();
        if let Err(e) = &res {
            debug!("failed to rebuild page {tag}: {e}");
        }
        res
    }
}
