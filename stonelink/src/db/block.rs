//! On-disk block encoding.
//!
//! Every block is page aligned, little endian, and starts with the common
//! 40-byte header. Records are never rewritten in place; a revision is
//! appended and linked to its predecessor through the header, so every
//! logical object is a singly linked chain whose tail carries
//! `prev_invalid`.

use crate::{page_align_up, PAGE_SIZE};
use alloc::{string::String, vec, vec::Vec};

use super::DbError;

/// Size of the common block header.
pub const BLOCK_HEADER_LEN: usize = 40;

/// Fixed length of entity names, NUL padded.
pub const NAME_LEN: usize = 64;

/// Magic stored in the superblock body.
pub const SUPERBLOCK_MAGIC: u64 = 0x4244_454e_4f54_5354; // "TSTONEDB"

/// On-disk block type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    /// The store root at location 0.
    Superblock = 0,
    /// A database entity revision.
    Database = 1,
    /// A list of table descriptors.
    TableList = 2,
    /// A table entity revision.
    Table = 3,
    /// A list of column declarations.
    ColumnList = 4,
    /// A list of index descriptors.
    IndexList = 5,
    /// One record version.
    Data = 6,
    /// A spilled large value.
    ValueLog = 7,
    /// A persisted index image.
    IndexTree = 8,
}

impl TryFrom<u32> for BlockType {
    type Error = DbError;

    fn try_from(raw: u32) -> Result<Self, DbError> {
        match raw {
            0 => Ok(Self::Superblock),
            1 => Ok(Self::Database),
            2 => Ok(Self::TableList),
            3 => Ok(Self::Table),
            4 => Ok(Self::ColumnList),
            5 => Ok(Self::IndexList),
            6 => Ok(Self::Data),
            7 => Ok(Self::ValueLog),
            8 => Ok(Self::IndexTree),
            other => Err(DbError::BadBlockType(other)),
        }
    }
}

/// The common header at the start of every block.
#[derive(Clone, Copy, Debug)]
pub struct BlockHeader {
    /// What the block holds.
    pub block_type: BlockType,
    /// Whole block size in bytes, a page multiple.
    pub block_size: u64,
    /// Location of the previous version of this object.
    pub prev_location: u64,
    /// Size of the previous version.
    pub prev_size: u64,
    /// Set on the last (oldest) link of the chain.
    pub prev_invalid: bool,
}

impl BlockHeader {
    /// A header for the first version of an object (no predecessor).
    #[must_use]
    pub fn first(block_type: BlockType, block_size: u64) -> Self {
        Self {
            block_type,
            block_size,
            prev_location: 0,
            prev_size: 0,
            prev_invalid: true,
        }
    }

    /// A header chaining to the previous version at `location`/`size`.
    /// A zero `location` degenerates to [`BlockHeader::first`].
    #[must_use]
    pub fn chained(block_type: BlockType, block_size: u64, location: u64, size: u64) -> Self {
        Self {
            block_type,
            block_size,
            prev_location: location,
            prev_size: size,
            prev_invalid: location == 0,
        }
    }

    /// Serializes the header into the first 40 bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&(self.block_type as u32).to_le_bytes());
        out[4..8].copy_from_slice(&0u32.to_le_bytes());
        out[8..16].copy_from_slice(&self.block_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.prev_location.to_le_bytes());
        out[24..32].copy_from_slice(&self.prev_size.to_le_bytes());
        out[32] = u8::from(self.prev_invalid);
        out[33..40].fill(0);
    }

    /// Decodes and validates a header. A block whose type is unknown or whose
    /// size is not a whole number of pages is treated as damaged.
    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        if bytes.len() < BLOCK_HEADER_LEN {
            return Err(DbError::ShortBlock);
        }
        let block_type = BlockType::try_from(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))?;
        let block_size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        if block_size == 0 || block_size % PAGE_SIZE != 0 {
            return Err(DbError::BadBlockSize(block_size));
        }
        Ok(Self {
            block_type,
            block_size,
            prev_location: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            prev_size: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            prev_invalid: bytes[32] != 0,
        })
    }
}

/// An in-memory block being assembled: header plus a little-endian body
/// cursor. `finish` pads the buffer to a page multiple and patches the final
/// size into the header.
#[derive(Debug)]
pub struct BlockWriter {
    block_type: BlockType,
    prev_location: u64,
    prev_size: u64,
    body: Vec<u8>,
}

impl BlockWriter {
    /// Starts a block chained to the previous version (zero for the first).
    #[must_use]
    pub fn new(block_type: BlockType, prev_location: u64, prev_size: u64) -> Self {
        Self {
            block_type,
            prev_location,
            prev_size,
            body: Vec::new(),
        }
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) {
        self.body.push(value);
    }

    /// Appends a little-endian u32.
    pub fn put_u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian u64.
    pub fn put_u64(&mut self, value: u64) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian i64.
    pub fn put_i64(&mut self, value: i64) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Appends a fixed 64-byte NUL-padded name. Longer names are rejected at
    /// the catalog layer before reaching here.
    pub fn put_name(&mut self, name: &str) {
        let mut buf = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        self.body.extend_from_slice(&buf);
    }

    /// Serializes header and body into one page-aligned buffer.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let raw_len = (BLOCK_HEADER_LEN + self.body.len()) as u64;
        let block_size = page_align_up(raw_len);
        let header = BlockHeader::chained(
            self.block_type,
            block_size,
            self.prev_location,
            self.prev_size,
        );
        let mut out = vec![0u8; block_size as usize];
        header.encode_into(&mut out);
        out[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + self.body.len()].copy_from_slice(&self.body);
        out
    }
}

/// Cursor over a decoded block body.
#[derive(Clone, Copy, Debug)]
pub struct BlockReader<'a> {
    /// The decoded, validated header.
    pub header: BlockHeader,
    body: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    /// Decodes the header and positions the cursor at the body start. The
    /// expected type is enforced so a broken previous-pointer cannot walk
    /// into an unrelated chain.
    pub fn new(bytes: &'a [u8], expect: BlockType) -> Result<Self, DbError> {
        let header = BlockHeader::decode(bytes)?;
        if header.block_type != expect {
            return Err(DbError::BadBlockType(header.block_type as u32));
        }
        Ok(Self {
            header,
            body: &bytes[BLOCK_HEADER_LEN..],
            pos: 0,
        })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DbError> {
        if self.pos + len > self.body.len() {
            return Err(DbError::ShortBlock);
        }
        let slice = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian u32.
    pub fn get_u32(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Reads a little-endian u64.
    pub fn get_u64(&mut self) -> Result<u64, DbError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a little-endian i64.
    pub fn get_i64(&mut self) -> Result<i64, DbError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], DbError> {
        self.take(len)
    }

    /// Reads a fixed 64-byte NUL-padded name.
    pub fn get_name(&mut self) -> Result<String, DbError> {
        let raw = self.take(NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&raw[..end])
            .map(String::from)
            .map_err(|_| DbError::ShortBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut writer = BlockWriter::new(BlockType::Table, 0x3000, 0x1000);
        writer.put_u64(42);
        writer.put_name("sections");
        let bytes = writer.finish();
        assert_eq!(bytes.len() as u64 % PAGE_SIZE, 0);

        let mut reader = BlockReader::new(&bytes, BlockType::Table).unwrap();
        assert_eq!(reader.header.prev_location, 0x3000);
        assert_eq!(reader.header.prev_size, 0x1000);
        assert!(!reader.header.prev_invalid);
        assert_eq!(reader.get_u64().unwrap(), 42);
        assert_eq!(reader.get_name().unwrap(), "sections");
    }

    #[test]
    fn first_version_terminates_chain() {
        let bytes = BlockWriter::new(BlockType::Data, 0, 0).finish();
        let reader = BlockReader::new(&bytes, BlockType::Data).unwrap();
        assert!(reader.header.prev_invalid);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = BlockWriter::new(BlockType::Data, 0, 0).finish();
        bytes[0] = 0xff;
        assert!(BlockHeader::decode(&bytes).is_err());
    }
}
