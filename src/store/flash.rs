//! Non-volatile flash devices.
//!
//! NOR-style semantics: erase sets a whole sector to `0xFF`, programming can
//! only clear bits, and the durable record is always written as one erase
//! followed by one whole-page program.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{HomewireError, Result};

/// Erase granularity.
pub const SECTOR_SIZE: usize = 4096;

/// Program granularity.
pub const PAGE_SIZE: usize = 256;

/// Offset of the durable record inside the flash image.
pub const TARGET_OFFSET: u32 = 256 * 1024;

/// Value of an erased byte.
pub const ERASED: u8 = 0xFF;

/// Minimum image size holding the target sector.
pub const IMAGE_SIZE: usize = TARGET_OFFSET as usize + SECTOR_SIZE;

/// A flash part addressed by byte offset.
pub trait Flash: Send {
    /// Copy `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Erase the sector starting at `offset` (must be sector-aligned).
    fn erase_sector(&mut self, offset: u32) -> Result<()>;

    /// Program one page at `offset` (must be page-aligned).
    fn program_page(&mut self, offset: u32, page: &[u8; PAGE_SIZE]) -> Result<()>;
}

fn check_aligned(offset: u32, align: usize, what: &str) -> Result<usize> {
    let offset = offset as usize;
    if offset % align != 0 {
        return Err(HomewireError::Flash(format!(
            "{what} offset {offset:#x} not aligned to {align:#x}"
        )));
    }
    Ok(offset)
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<()> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(HomewireError::Flash(format!(
            "range {offset:#x}+{len:#x} outside {size:#x}-byte image"
        )));
    }
    Ok(())
}

/// In-memory flash image with operation counters.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    image: Vec<u8>,
    erases: usize,
    programs: usize,
}

impl Default for MemoryFlash {
    fn default() -> Self {
        Self::new(IMAGE_SIZE)
    }
}

impl MemoryFlash {
    /// A fully erased image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            image: vec![ERASED; size],
            erases: 0,
            programs: 0,
        }
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn program_count(&self) -> usize {
        self.programs
    }

    /// Raw image contents.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Raw image contents, for corrupting pages in tests.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }
}

impl Flash for MemoryFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        check_bounds(start, buf.len(), self.image.len())?;
        buf.copy_from_slice(&self.image[start..start + buf.len()]);
        Ok(())
    }

    fn erase_sector(&mut self, offset: u32) -> Result<()> {
        let start = check_aligned(offset, SECTOR_SIZE, "erase")?;
        check_bounds(start, SECTOR_SIZE, self.image.len())?;
        self.image[start..start + SECTOR_SIZE].fill(ERASED);
        self.erases += 1;
        Ok(())
    }

    fn program_page(&mut self, offset: u32, page: &[u8; PAGE_SIZE]) -> Result<()> {
        let start = check_aligned(offset, PAGE_SIZE, "program")?;
        check_bounds(start, PAGE_SIZE, self.image.len())?;
        for (cell, byte) in self.image[start..start + PAGE_SIZE].iter_mut().zip(page) {
            *cell &= *byte;
        }
        self.programs += 1;
        Ok(())
    }
}

/// Flash image persisted in a host file.
///
/// The file is created (fully erased) on first open and grown to
/// [`IMAGE_SIZE`] if shorter.
#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    file: File,
}

impl FileFlash {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len() as usize;
        if len < IMAGE_SIZE {
            file.seek(SeekFrom::Start(len as u64))?;
            file.write_all(&vec![ERASED; IMAGE_SIZE - len])?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), "Initialized flash image");
        }

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Flash for FileFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset as usize, buf.len(), IMAGE_SIZE)?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn erase_sector(&mut self, offset: u32) -> Result<()> {
        let start = check_aligned(offset, SECTOR_SIZE, "erase")?;
        check_bounds(start, SECTOR_SIZE, IMAGE_SIZE)?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&[ERASED; SECTOR_SIZE])?;
        self.file.sync_data()?;
        Ok(())
    }

    fn program_page(&mut self, offset: u32, page: &[u8; PAGE_SIZE]) -> Result<()> {
        let start = check_aligned(offset, PAGE_SIZE, "program")?;
        check_bounds(start, PAGE_SIZE, IMAGE_SIZE)?;

        let mut current = [0u8; PAGE_SIZE];
        self.read(offset, &mut current)?;
        for (cell, byte) in current.iter_mut().zip(page) {
            *cell &= *byte;
        }

        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&current)?;
        self.file.sync_data()?;
        Ok(())
    }
}
