use crate::mem::mmap::MmapRegion;
use crate::mem::spt::SupplementalPageTable;
use crate::paging::PageTableRef;
use alloc::vec::Vec;
use marrowos_shared::mem::USER_STACK;

pub type Pid = u16;

/// Register state saved when an interrupt enters the kernel. The fault
/// handler only consumes the user stack pointer; the full frame layout
/// belongs to the interrupt plumbing.
pub struct IntrFrame {
    pub rsp: usize,
}

/// Per-process virtual-memory state.
///
/// The supplemental page table and the mapping list are only ever touched by
/// the owning thread; the page table handle is shared with the frame table
/// so eviction can reach the owner's translations.
pub struct Process {
    pub pid: Pid,
    pub pagetable: PageTableRef,
    pub spt: SupplementalPageTable,
    pub mmap_regions: Vec<MmapRegion>,
    /// Stack pointer saved on syscall entry, consulted when a fault
    /// originates in kernel mode.
    pub user_rsp: usize,
}

impl Process {
    pub fn new(pid: Pid, pagetable: PageTableRef) -> Process {
        Process {
            pid,
            pagetable,
            spt: SupplementalPageTable::new(),
            mmap_regions: Vec::new(),
            user_rsp: USER_STACK,
        }
    }
}
