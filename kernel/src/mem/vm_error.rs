use crate::block::block_error::BlockError;
use crate::fs::FsError;
use core::fmt::{Debug, Display, Formatter};

/// Error type for virtual-memory operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The swap disk has no free slot left
    OutOfSwap,
    /// No frame could be allocated and eviction found no victim
    OutOfFrames,
    /// A page descriptor for the virtual address already exists
    AlreadyMapped,
    /// The hardware mapping could not be installed
    MapInstall,
    /// The address maps no page and is not a valid stack extension
    InvalidAccess,
    /// A user-supplied pointer range is not readable user memory
    BadUserPointer,
    /// The swap disk failed
    Disk(BlockError),
    /// The backing file failed
    File(FsError),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfSwap => write!(f, "out of swap slots"),
            VmError::OutOfFrames => write!(f, "out of frames"),
            VmError::AlreadyMapped => write!(f, "virtual address already mapped"),
            VmError::MapInstall => write!(f, "could not install hardware mapping"),
            VmError::InvalidAccess => write!(f, "invalid access"),
            VmError::BadUserPointer => write!(f, "bad user pointer"),
            VmError::Disk(e) => write!(f, "swap disk: {e}"),
            VmError::File(e) => write!(f, "backing file: {e}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(e: BlockError) -> VmError {
        VmError::Disk(e)
    }
}

impl From<FsError> for VmError {
    fn from(e: FsError) -> VmError {
        VmError::File(e)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
