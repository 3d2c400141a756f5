//! Process-wide array of buffer control blocks.
//!
//! There is one slot per buffer, parallel to the buffer pool. A slot holds:
//!
//! - the buffer header: the IO-in-progress / valid / dirty bits, guarded by a
//!   short critical section that is never held across a blocking wait,
//! - a condition variable that is signalled whenever an IO on the buffer ends,
//! - the control block proper ([`BufferCtrl`]): ownership mode, read hints,
//!   early-dirty metadata and the physical redirect.
//!
//! The table is allocated once and never resized. Lock order within a slot is
//! header before control block.

use bitflags::bitflags;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::context::WorkerId;
use crate::lock_mode::BufLockMode;
use crate::types::{BufferId, PhysicalBlock, RelPersistence, SegFileLocation};

bitflags! {
    /// Read hints and persistence bits of a control block.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct CtrlState: u8 {
        const NEED_LOAD = 0x01;
        const IS_LOADED = 0x02;
        const LOAD_FAILED = 0x04;
        const NEED_TRANSFER = 0x08;
        const IS_EXTEND = 0x10;
        const IS_RELPERSISTENT = 0x20;
        const IS_RELPERSISTENT_TEMP = 0x40;

        /// Hints that only live for the duration of one read.
        const TRANSIENT = Self::NEED_LOAD.bits()
            | Self::IS_LOADED.bits()
            | Self::LOAD_FAILED.bits()
            | Self::NEED_TRANSFER.bits()
            | Self::IS_EXTEND.bits();
    }
}

bitflags! {
    /// Buffer header bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HeaderFlags: u8 {
        const IO_IN_PROGRESS = 0x01;
        const VALID = 0x02;
        const DIRTY = 0x04;
        const JUST_DIRTIED = 0x08;
        const IO_ERROR = 0x10;
    }
}

/// Ownership and read-hint metadata of one buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferCtrl {
    pub buf_id: u32,
    pub state: CtrlState,
    pub is_remote_dirty: bool,
    pub lock_mode: BufLockMode,
    pub is_edp: bool,
    pub force_request: bool,
    pub edp_scn: u64,
    pub edp_map: u64,
    /// Physical redirect. `None` is the sentinel: the triple is either fully
    /// set or fully unset.
    pub pblk: Option<PhysicalBlock>,
}

impl BufferCtrl {
    fn new(buf_id: u32) -> Self {
        BufferCtrl {
            buf_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct BufferHeader {
    pub flags: HeaderFlags,
    /// Worker that holds the IO claim, valid while `IO_IN_PROGRESS` is set.
    pub io_owner: Option<WorkerId>,
    /// Cached physical location of a segment-organized page.
    pub seg_location: Option<SegFileLocation>,
}

#[repr(align(64))]
pub struct BufferSlot {
    pub(crate) header: Mutex<BufferHeader>,
    pub(crate) io_done: Condvar,
    pub(crate) ctrl: Mutex<BufferCtrl>,
}

impl BufferSlot {
    fn new(buf_id: u32) -> Self {
        BufferSlot {
            header: Mutex::new(BufferHeader::default()),
            io_done: Condvar::new(),
            ctrl: Mutex::new(BufferCtrl::new(buf_id)),
        }
    }
}

pub struct ControlTable {
    slots: Box<[BufferSlot]>,
}

static BUFFER_CTRL: OnceCell<ControlTable> = OnceCell::new();

impl ControlTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| BufferSlot::new(i as u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ControlTable { slots }
    }

    /// Attach to the process-wide table, creating it on first call. Later
    /// callers get the existing table untouched, whatever capacity they ask for.
    pub fn init(capacity: usize) -> &'static ControlTable {
        Self::init_in(&BUFFER_CTRL, capacity)
    }

    /// Like [`ControlTable::init`], with an explicit gate.
    pub fn init_in(gate: &OnceCell<ControlTable>, capacity: usize) -> &ControlTable {
        let mut created = false;
        let table = gate.get_or_init(|| {
            created = true;
            ControlTable::new(capacity)
        });
        if !created {
            debug!("buffer control table already initialized");
        }
        table
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot of buffer `id`. Panics if `id` is outside `[0, capacity)`.
    pub fn slot(&self, id: BufferId) -> &BufferSlot {
        &self.slots[id.index()]
    }

    /// Copy of the control block.
    pub fn get(&self, id: BufferId) -> BufferCtrl {
        *self.slot(id).ctrl.lock()
    }

    /// Run `f` with the control block locked.
    pub fn update<R>(&self, id: BufferId, f: impl FnOnce(&mut BufferCtrl) -> R) -> R {
        f(&mut self.slot(id).ctrl.lock())
    }

    pub fn header_flags(&self, id: BufferId) -> HeaderFlags {
        self.slot(id).header.lock().flags
    }

    pub fn seg_location(&self, id: BufferId) -> Option<SegFileLocation> {
        self.slot(id).header.lock().seg_location
    }

    /// Set by the buffer manager when a page is modified.
    pub fn mark_dirty(&self, id: BufferId) {
        self.slot(id).header.lock().flags |= HeaderFlags::DIRTY | HeaderFlags::JUST_DIRTIED;
    }

    /// Set by the buffer manager after the page has been written out.
    pub fn clear_dirty(&self, id: BufferId) {
        self.slot(id)
            .header
            .lock()
            .flags
            .remove(HeaderFlags::DIRTY | HeaderFlags::JUST_DIRTIED);
    }

    /// Record how the upcoming read should treat the buffer.
    pub fn mark_read_hint(
        &self,
        id: BufferId,
        persistence: RelPersistence,
        extend: bool,
        pblk: Option<PhysicalBlock>,
    ) {
        self.update(id, |ctrl| {
            match persistence {
                RelPersistence::Permanent => ctrl.state |= CtrlState::IS_RELPERSISTENT,
                RelPersistence::Temp => ctrl.state |= CtrlState::IS_RELPERSISTENT_TEMP,
                RelPersistence::Unlogged => {}
            }
            if extend {
                ctrl.state |= CtrlState::IS_EXTEND;
            }
            set_pblk(ctrl, pblk);
        });
    }

    /// Set or reset the physical redirect.
    pub fn mark_read_pblk(&self, id: BufferId, pblk: Option<PhysicalBlock>) {
        self.update(id, |ctrl| set_pblk(ctrl, pblk));
    }

    /// Clear the transient read hints. With `full`, the whole block is zeroed,
    /// which is what a deleted or invalidated buffer needs.
    pub fn reset(&self, id: BufferId, full: bool) {
        self.update(id, |ctrl| {
            ctrl.state.remove(CtrlState::TRANSIENT);
            if full {
                *ctrl = BufferCtrl::new(ctrl.buf_id);
            }
        });
    }
}

fn set_pblk(ctrl: &mut BufferCtrl, pblk: Option<PhysicalBlock>) {
    if let Some(p) = &pblk {
        debug_assert!(p.is_valid(), "partial physical redirect {p:?}");
    }
    ctrl.pblk = pblk;
}
