//! Accessors for the standard page header.
//!
//! Only the fields the coherence layer touches are exposed: the page LSN, the
//! checksum, and `pd_upper` (a zero `pd_upper` marks a page that was never
//! initialized).

use crate::types::{BLCKSZ, Lsn};

const PD_LSN_OFFSET: usize = 0;
const PD_CHECKSUM_OFFSET: usize = 8;
const PD_LOWER_OFFSET: usize = 12;
const PD_UPPER_OFFSET: usize = 14;
/// Size of the fixed page header.
pub const SIZE_OF_PAGE_HEADER: u16 = 24;

/// One page worth of bytes.
pub struct Page {
    data: Box<[u8; BLCKSZ]>,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            data: Box::new([0u8; BLCKSZ]),
        }
    }
}

impl Page {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Initialize an empty page header with the given LSN.
    pub fn init(&mut self, lsn: Lsn) {
        self.zero();
        self.write_u16(PD_LOWER_OFFSET, SIZE_OF_PAGE_HEADER);
        self.write_u16(PD_UPPER_OFFSET, BLCKSZ as u16);
        self.set_lsn(lsn);
    }

    pub fn is_new(&self) -> bool {
        self.read_u16(PD_UPPER_OFFSET) == 0
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// The LSN is stored as two 32-bit halves, high half first.
    pub fn lsn(&self) -> Lsn {
        let hi = self.read_u32(PD_LSN_OFFSET) as u64;
        let lo = self.read_u32(PD_LSN_OFFSET + 4) as u64;
        Lsn((hi << 32) | lo)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.write_u32(PD_LSN_OFFSET, (lsn.0 >> 32) as u32);
        self.write_u32(PD_LSN_OFFSET + 4, lsn.0 as u32);
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(PD_CHECKSUM_OFFSET)
    }

    /// Checksum of the page contents as if `pd_checksum` were zero, mixed with
    /// the block number so that a page written to the wrong block is caught.
    /// Never returns zero.
    pub fn compute_checksum(&self, block_number: u32) -> u16 {
        let mut crc = crc32c::crc32c(&self.data[..PD_CHECKSUM_OFFSET]);
        crc = crc32c::crc32c_append(crc, &[0u8; 2]);
        crc = crc32c::crc32c_append(crc, &self.data[PD_CHECKSUM_OFFSET + 2..]);
        (((crc ^ block_number) % 65535) + 1) as u16
    }

    /// Stamp the checksum before the page leaves this node. New pages are left
    /// alone: they have no header to protect.
    pub fn set_checksum_inplace(&mut self, block_number: u32) {
        if self.is_new() {
            return;
        }
        let checksum = self.compute_checksum(block_number);
        self.write_u16(PD_CHECKSUM_OFFSET, checksum);
    }

    pub fn verify_checksum(&self, block_number: u32) -> bool {
        self.is_new() || self.checksum() == self.compute_checksum(block_number)
    }

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_ne_bytes([self.data[off], self.data[off + 1]])
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.data[off..off + 2].copy_from_slice(&v.to_ne_bytes());
    }

    fn read_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[off..off + 4]);
        u32::from_ne_bytes(b)
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_ne_bytes());
    }
}
