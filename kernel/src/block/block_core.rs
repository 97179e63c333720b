use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::result::Result;
use core::sync::atomic::{self, AtomicU32};

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Lower-level interface to block device drivers
pub trait BlockOp: Send {
    /// Read a block sector into `buf`, which holds `BLOCK_SECTOR_SIZE` bytes.
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write a block sector from `buf`, which holds `BLOCK_SECTOR_SIZE` bytes.
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A sector-addressed block device, such as the swap disk.
pub struct Block {
    /// The name of the block device
    name: String,
    /// The size of the block device in sectors
    size: BlockSector,
    /// The block driver
    driver: Mutex<Box<dyn BlockOp>>,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    pub fn new(name: &str, size: BlockSector, driver: Box<dyn BlockOp>) -> Block {
        Block {
            name: String::from(name),
            size,
            driver: Mutex::new(driver),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn is_buffer_valid(buf: &[u8]) -> bool {
        buf.len() == BLOCK_SECTOR_SIZE
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn is_sector_valid(&self, sector: BlockSector) -> bool {
        sector < self.size
    }

    /// Reads sector `sector` from the block device into `buf`, which must have
    /// room for `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if !self.is_sector_valid(sector) {
            return Err(BlockError::SectorOutOfBounds);
        }
        if !Self::is_buffer_valid(buf) {
            return Err(BlockError::BufferInvalid);
        }

        self.read_count.fetch_add(1, atomic::Ordering::Relaxed);
        self.driver.lock().read(sector, buf)
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE`
    /// bytes. Returns after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if !self.is_sector_valid(sector) {
            return Err(BlockError::SectorOutOfBounds);
        }
        if !Self::is_buffer_valid(buf) {
            return Err(BlockError::BufferInvalid);
        }

        self.write_count.fetch_add(1, atomic::Ordering::Relaxed);
        self.driver.lock().write(sector, buf)
    }

    // Block getters -----------------------------------------------------------

    pub fn size(&self) -> BlockSector {
        self.size
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(atomic::Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(atomic::Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\": {:04} sectors, {:04} read, {:04} write",
            self.name,
            self.size,
            self.read_count(),
            self.write_count(),
        )
    }
}
