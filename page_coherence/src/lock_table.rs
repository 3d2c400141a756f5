//! Local registry of held locks, split into latched partitions.
//!
//! Only the bookkeeping the DDL broadcast path needs is kept here: which
//! holder has which modes on which lock. Lock conflicts and waiting are the
//! lock manager's business.
//!
//! Anyone latching more than one partition must do so in ascending partition
//! order and unlatch in descending order.

use std::collections::HashMap;
use std::fmt;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

pub const NUM_LOCK_PARTITIONS: usize = 16;
pub const DEFAULT_LOCKMETHOD: u8 = 1;

/// Lockable object kinds, from coarsest to finest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockTagType {
    Relation = 0,
    RelationExtend,
    Partition,
    PartitionSequence,
    Page,
    Tuple,
    Transaction,
    VirtualTransaction,
    Object,
    CstoreFreespace,
    Userlock,
    Advisory,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LockTag {
    pub field1: u32,
    pub field2: u32,
    pub field3: u32,
    pub field4: u32,
    pub field5: u32,
    pub locktag_type: LockTagType,
    pub lockmethodid: u8,
}

impl LockTag {
    fn new(locktag_type: LockTagType, fields: [u32; 5]) -> Self {
        LockTag {
            field1: fields[0],
            field2: fields[1],
            field3: fields[2],
            field4: fields[3],
            field5: fields[4],
            locktag_type,
            lockmethodid: DEFAULT_LOCKMETHOD,
        }
    }

    pub fn relation(db_oid: u32, rel_oid: u32) -> Self {
        Self::new(LockTagType::Relation, [db_oid, rel_oid, 0, 0, 0])
    }

    pub fn partition(db_oid: u32, rel_oid: u32, part_oid: u32) -> Self {
        Self::new(LockTagType::Partition, [db_oid, rel_oid, part_oid, 0, 0])
    }

    pub fn page(db_oid: u32, rel_oid: u32, block: u32) -> Self {
        Self::new(LockTagType::Page, [db_oid, rel_oid, block, 0, 0])
    }

    pub fn tuple(db_oid: u32, rel_oid: u32, block: u32, offset: u16) -> Self {
        Self::new(LockTagType::Tuple, [db_oid, rel_oid, block, offset as u32, 0])
    }

    pub fn transaction(xid: u64) -> Self {
        Self::new(
            LockTagType::Transaction,
            [xid as u32, (xid >> 32) as u32, 0, 0, 0],
        )
    }

    pub fn object(db_oid: u32, class_oid: u32, obj_oid: u32, obj_subid: u32) -> Self {
        Self::new(
            LockTagType::Object,
            [db_oid, class_oid, obj_oid, obj_subid, 0],
        )
    }

    /// Locks that must be reasserted cluster-wide after a reform: anything
    /// coarser than a page, and catalog objects.
    pub fn is_cluster_wide(&self) -> bool {
        self.locktag_type < LockTagType::Page || self.locktag_type == LockTagType::Object
    }

    fn hash_code(&self) -> u32 {
        let mut bytes = [0u8; 22];
        for (i, f) in [self.field1, self.field2, self.field3, self.field4, self.field5]
            .iter()
            .enumerate()
        {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        bytes[20] = self.locktag_type as u8;
        bytes[21] = self.lockmethodid;
        crc32c::crc32c(&bytes)
    }

    pub fn partition_index(&self) -> usize {
        self.hash_code() as usize % NUM_LOCK_PARTITIONS
    }
}

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}:{}/{}/{}/{}/{}",
            self.locktag_type, self.field1, self.field2, self.field3, self.field4, self.field5
        )
    }
}

/// Table lock modes, weakest first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockMode {
    NoLock = 0,
    AccessShare = 1,
    RowShare = 2,
    RowExclusive = 3,
    ShareUpdateExclusive = 4,
    Share = 5,
    ShareRowExclusive = 6,
    Exclusive = 7,
    AccessExclusive = 8,
}

/// Set of lock modes held by one holder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockMask(u16);

impl LockMask {
    pub fn bit(mode: LockMode) -> LockMask {
        LockMask(1 << mode as u16)
    }

    pub fn contains(self, mode: LockMode) -> bool {
        self.0 & Self::bit(mode).0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn insert(&mut self, mode: LockMode) {
        self.0 |= Self::bit(mode).0;
    }

    fn remove(&mut self, mode: LockMode) {
        self.0 &= !Self::bit(mode).0;
    }
}

type Partition = HashMap<(LockTag, u32), LockMask>;

/// One holder's modes on one lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcLock {
    pub tag: LockTag,
    pub holder: u32,
    pub hold_mask: LockMask,
}

pub struct LockTable {
    partitions: Box<[RwLock<Partition>]>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            partitions: (0..NUM_LOCK_PARTITIONS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, tag: &LockTag) -> &RwLock<Partition> {
        &self.partitions[tag.partition_index()]
    }

    pub fn grant(&self, tag: LockTag, holder: u32, mode: LockMode) {
        self.partition(&tag)
            .write()
            .entry((tag, holder))
            .or_default()
            .insert(mode);
    }

    /// Returns false if `holder` did not hold `mode`.
    pub fn release(&self, tag: &LockTag, holder: u32, mode: LockMode) -> bool {
        let mut partition = self.partition(tag).write();
        let key = (*tag, holder);
        let Some(mask) = partition.get_mut(&key) else {
            return false;
        };
        if !mask.contains(mode) {
            return false;
        }
        mask.remove(mode);
        if mask.is_empty() {
            partition.remove(&key);
        }
        true
    }

    pub fn holds(&self, tag: &LockTag, holder: u32, mode: LockMode) -> bool {
        self.partition(tag)
            .read()
            .get(&(*tag, holder))
            .is_some_and(|mask| mask.contains(mode))
    }

    /// Latch every partition in shared mode, in ascending order. The latches
    /// are released in descending order when the guard is dropped.
    pub fn latch_all_shared(&self) -> AllPartitionsGuard<'_> {
        let guards = self.partitions.iter().map(|p| p.read()).collect();
        AllPartitionsGuard { guards }
    }

    #[cfg(test)]
    pub(crate) fn partition_latch(&self, idx: usize) -> &RwLock<Partition> {
        &self.partitions[idx]
    }
}

pub struct AllPartitionsGuard<'a> {
    guards: Vec<RwLockReadGuard<'a, Partition>>,
}

impl AllPartitionsGuard<'_> {
    pub fn proc_locks(&self) -> impl Iterator<Item = ProcLock> + '_ {
        self.guards.iter().flat_map(|partition| {
            partition.iter().map(|(&(tag, holder), &hold_mask)| ProcLock {
                tag,
                holder,
                hold_mask,
            })
        })
    }
}

impl Drop for AllPartitionsGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
