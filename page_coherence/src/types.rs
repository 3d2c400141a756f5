//! Identifiers shared by the buffer-side and the lock-side of the bridge.

use std::fmt;

use serde::{Deserialize, Serialize};
use zerocopy::{Immutable, IntoBytes};

/// Size of one page in bytes.
pub const BLCKSZ: usize = 8192;

pub const INVALID_OID: u32 = 0;
pub const INVALID_BLOCK_NUMBER: u32 = u32::MAX;
/// `bucket_node` of relations that are not segment-organized.
pub const INVALID_BUCKET: i32 = -1;

/// A log sequence number.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Index of a buffer slot. The same index addresses the buffer pool and the
/// control table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl BufferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a cached page. Also the resource id sent to the directory, so
/// the layout is fixed and free of padding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoBytes, Immutable)]
#[repr(C)]
pub struct BufferTag {
    pub spc_oid: u32,
    pub db_oid: u32,
    pub rel_number: u32,
    pub bucket_node: i32,
    pub fork_number: i32,
    pub block_number: u32,
}

/// Length of the page resource id in a request context.
pub const PAGEID_SIZE: usize = std::mem::size_of::<BufferTag>();

impl BufferTag {
    /// Segment-organized relations carry a bucket node.
    pub fn is_segment(&self) -> bool {
        self.bucket_node > INVALID_BUCKET
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} {}-{}",
            self.spc_oid,
            self.db_oid,
            self.rel_number,
            self.bucket_node,
            self.fork_number,
            self.block_number
        )
    }
}

/// Where a page with a redirected logical identity physically lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysicalBlock {
    /// Extent type of the segment file.
    pub rel_node: u32,
    pub block: u32,
    pub lsn: Lsn,
}

impl PhysicalBlock {
    pub fn is_valid(&self) -> bool {
        self.rel_node != INVALID_OID && self.block != INVALID_BLOCK_NUMBER
    }
}

/// Physical location of a segment-organized page, as returned by the segment
/// lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegPageLocation {
    /// Extent size in blocks.
    pub extent_size: u32,
    pub block_number: u32,
}

/// The cached form of [`SegPageLocation`] kept with the buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegFileLocation {
    pub seg_fileno: u8,
    pub seg_blockno: u32,
}

impl SegPageLocation {
    /// Extent sizes map to segment file numbers 1..=5.
    pub fn to_file_location(self) -> Option<SegFileLocation> {
        let seg_fileno = match self.extent_size {
            1 => 1,
            8 => 2,
            128 => 3,
            1024 => 4,
            4096 => 5,
            _ => return None,
        };
        Some(SegFileLocation {
            seg_fileno,
            seg_blockno: self.block_number,
        })
    }
}

/// How the caller wants the page read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadBufferMode {
    Normal,
    ZeroAndLock,
    ZeroAndCleanupLock,
    ZeroOnError,
    NormalNoLog,
}

impl ReadBufferMode {
    /// Modes that return the buffer with its content lock held exclusively.
    pub fn locks_after_read(self) -> bool {
        matches!(
            self,
            ReadBufferMode::ZeroAndLock | ReadBufferMode::ZeroAndCleanupLock
        )
    }
}

/// Relation persistence, as recorded in the catalog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelPersistence {
    Permanent,
    Unlogged,
    Temp,
}

impl TryFrom<char> for RelPersistence {
    type Error = char;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            'p' => Ok(RelPersistence::Permanent),
            'u' => Ok(RelPersistence::Unlogged),
            't' => Ok(RelPersistence::Temp),
            other => Err(other),
        }
    }
}
