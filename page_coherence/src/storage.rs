//! Local collaborators: the buffer pool's pages, physical reads from shared
//! storage, and buffer content locks. None of these are implemented here.

use parking_lot::Mutex;
use thiserror::Error;

use crate::context::WorkerContext;
use crate::page::Page;
use crate::types::{BufferId, BufferTag, PhysicalBlock, ReadBufferMode, SegPageLocation};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not read block {tag}")]
    Read {
        tag: BufferTag,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid page in block {0}")]
    InvalidPage(BufferTag),
}

/// Which kind of page a read is for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadTarget {
    /// A relation page, possibly redirected to a physical segment block.
    Relation { pblk: Option<PhysicalBlock> },
    /// A segment metadata page.
    Segment,
}

pub trait LocalStorage: Send + Sync {
    fn buffer_tag(&self, buf: BufferId) -> BufferTag;

    /// Page memory of a buffer.
    fn page(&self, buf: BufferId) -> &Mutex<Page>;

    /// Read the page from shared storage into the buffer.
    fn read_page(
        &self,
        buf: BufferId,
        tag: &BufferTag,
        mode: ReadBufferMode,
        target: ReadTarget,
    ) -> Result<(), StorageError>;

    /// Read the on-disk copy of the page into `dst`, leaving the buffer alone.
    fn read_page_for_verification(
        &self,
        tag: &BufferTag,
        target: ReadTarget,
        dst: &mut Page,
    ) -> Result<(), StorageError>;

    /// Current length of the relation fork in blocks.
    fn relation_nblocks(&self, tag: &BufferTag) -> u32;

    /// Physical location of a segment-organized page.
    fn segment_location(&self, tag: &BufferTag) -> Option<SegPageLocation>;

    /// Drop the buffer's contents from the pool.
    fn invalidate_buffer(&self, buf: BufferId);

    fn content_lock_held(&self, worker: &WorkerContext, buf: BufferId) -> bool;

    fn lock_content_exclusive(&self, worker: &WorkerContext, buf: BufferId);
}
