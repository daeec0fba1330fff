//! The module bridging the module database onto disk.
//!
//! The block store reads and writes through the UEFI `SimpleFileSystem`
//! protocol. The protocol and the Rust layer are both not thread safe due
//! to the dependency on the UEFI system table, so file operations take the
//! system table lock internally. When no database file exists on the boot
//! volume, the boot path falls back to a memory-backed store.

use crate::system_table::{image_handle, system_table, system_table_unsafe};
use alloc::{vec, vec::Vec};
use log::error;
use stonelink::{
    db::{
        io::{BlockIo, MemoryBlockIo},
        DbError,
    },
    page_align_up, PAGE_SIZE,
};
use uefi::proto::media::file::{File, FileAttribute, FileMode, FileType, RegularFile};

/// A [`BlockIo`] over one regular file on the boot volume.
pub(crate) struct FileBlockIo {
    file: RegularFile,
    end: u64,
}

impl FileBlockIo {
    /// Opens `path` read-write on the volume this image booted from,
    /// creating it when absent.
    pub(crate) fn open(path: &str) -> Result<Self, uefi::Error> {
        // Safety: the boot path is single threaded.
        let st = unsafe { system_table_unsafe() };
        let bs = st.boot_services();
        let mut volume = bs.get_image_file_system(image_handle())?.open_volume()?;

        const BUF_SIZE: usize = 255;
        let mut buf = [0; BUF_SIZE + 1];
        let name = uefi::CStr16::from_str_with_buf(path, &mut buf)
            .map_err(|_err| uefi::Status::INVALID_PARAMETER)?;

        let handle = volume
            .open(name, FileMode::CreateReadWrite, FileAttribute::empty())
            .map_err(|err| {
                error!("{path:#?}: {:#?}", err.status());
                err
            })?;
        let mut file = match handle.into_type()? {
            FileType::Regular(file) => file,
            FileType::Dir(_) => {
                error!("{path:#?} is not a file");
                return Err(uefi::Error::from(uefi::Status::INVALID_PARAMETER));
            }
        };

        let end = {
            let _lock = system_table();
            file.set_position(RegularFile::END_OF_FILE)?;
            file.get_position()?
        };
        Ok(Self { file, end })
    }
}

impl BlockIo for FileBlockIo {
    fn read(&mut self, location: u64, size: u64) -> Result<Vec<u8>, DbError> {
        if location % PAGE_SIZE != 0 || location + size > self.end {
            return Err(DbError::BadLocation(location));
        }
        let mut out = vec![0u8; size as usize];
        let _lock = system_table();
        self.file
            .set_position(location)
            .map_err(|_err| DbError::BadLocation(location))?;
        let read = self
            .file
            .read(&mut out)
            .map_err(|_err| DbError::BadLocation(location))?;
        if read as u64 != size {
            return Err(DbError::ShortBlock);
        }
        Ok(out)
    }

    fn write(&mut self, location: u64, data: &[u8]) -> Result<(), DbError> {
        if location % PAGE_SIZE != 0 {
            return Err(DbError::BadLocation(location));
        }
        let _lock = system_table();
        self.file
            .set_position(location)
            .map_err(|_err| DbError::BadLocation(location))?;
        self.file
            .write(data)
            .map_err(|_err| DbError::BadLocation(location))?;
        self.end = self.end.max(page_align_up(location + data.len() as u64));
        Ok(())
    }

    fn end(&self) -> u64 {
        self.end
    }

    fn flush(&mut self) -> Result<(), DbError> {
        let _lock = system_table();
        self.file.flush().map_err(|_err| DbError::ShortBlock)
    }
}

/// The store backend the boot path settles on: the on-disk database when
/// the boot volume carries one, a seeded in-memory store otherwise.
pub(crate) enum BootBlockIo {
    File(FileBlockIo),
    Memory(MemoryBlockIo),
}

impl BlockIo for BootBlockIo {
    fn read(&mut self, location: u64, size: u64) -> Result<Vec<u8>, DbError> {
        match self {
            Self::File(io) => io.read(location, size),
            Self::Memory(io) => io.read(location, size),
        }
    }

    fn write(&mut self, location: u64, data: &[u8]) -> Result<(), DbError> {
        match self {
            Self::File(io) => io.write(location, data),
            Self::Memory(io) => io.write(location, data),
        }
    }

    fn end(&self) -> u64 {
        match self {
            Self::File(io) => io.end(),
            Self::Memory(io) => io.end(),
        }
    }

    fn flush(&mut self) -> Result<(), DbError> {
        match self {
            Self::File(io) => io.flush(),
            Self::Memory(io) => io.flush(),
        }
    }
}
