//! The block-device seam of the database.
//!
//! The kernel implements [`BlockIo`] over a UEFI file; tests use
//! [`MemoryBlockIo`]. Locations are byte offsets of page-aligned blocks
//! within the backing store, and location 0 is reserved for the superblock.

use crate::{page_align_up, PAGE_SIZE};
use alloc::{vec, vec::Vec};
use bit_vec::BitVec;

use super::DbError;

/// Backend storage for the block store. All writes are whole, page-aligned
/// blocks; all blocks other than the superblock are written append-only.
pub trait BlockIo {
    /// Reads `size` bytes starting at `location`.
    fn read(&mut self, location: u64, size: u64) -> Result<Vec<u8>, DbError>;

    /// Writes `data` at `location`, growing the store as needed.
    fn write(&mut self, location: u64, data: &[u8]) -> Result<(), DbError>;

    /// Current end of the store in bytes (always page aligned).
    fn end(&self) -> u64;

    /// Flushes buffered writes to stable storage.
    fn flush(&mut self) -> Result<(), DbError>;
}

/// A `Vec<u8>`-backed [`BlockIo`] used by the test suite and by manifest
/// staging. Tracks which pages have ever been written so that reads of
/// never-written locations fail instead of returning zeros.
#[derive(Debug, Default)]
pub struct MemoryBlockIo {
    bytes: Vec<u8>,
    written: BitVec,
}

impl MemoryBlockIo {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_len(&mut self, len: u64) {
        let len = page_align_up(len) as usize;
        if self.bytes.len() < len {
            self.bytes.resize(len, 0);
        }
        let pages = len / PAGE_SIZE as usize;
        if self.written.len() < pages {
            self.written.grow(pages - self.written.len(), false);
        }
    }
}

impl BlockIo for MemoryBlockIo {
    fn read(&mut self, location: u64, size: u64) -> Result<Vec<u8>, DbError> {
        let end = location.checked_add(size).ok_or(DbError::BadLocation(location))?;
        if end > self.bytes.len() as u64 || location % PAGE_SIZE != 0 {
            return Err(DbError::BadLocation(location));
        }
        let first_page = (location / PAGE_SIZE) as usize;
        if !self.written.get(first_page).unwrap_or(false) {
            return Err(DbError::BadLocation(location));
        }
        Ok(self.bytes[location as usize..end as usize].to_vec())
    }

    fn write(&mut self, location: u64, data: &[u8]) -> Result<(), DbError> {
        if location % PAGE_SIZE != 0 {
            return Err(DbError::BadLocation(location));
        }
        self.ensure_len(location + data.len() as u64);
        self.bytes[location as usize..location as usize + data.len()].copy_from_slice(data);
        let first_page = (location / PAGE_SIZE) as usize;
        let page_count = page_align_up(data.len() as u64) / PAGE_SIZE;
        for i in 0..page_count as usize {
            self.written.set(first_page + i, true);
        }
        Ok(())
    }

    fn end(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn flush(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Reserves space for an in-memory image of `page_count` pages up front.
impl From<usize> for MemoryBlockIo {
    fn from(page_count: usize) -> Self {
        Self {
            bytes: vec![0; page_count * PAGE_SIZE as usize],
            written: BitVec::from_elem(page_count, false),
        }
    }
}
