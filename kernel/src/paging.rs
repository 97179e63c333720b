//! The page-table interface the VM core drives, and a software
//! implementation of it.
//!
//! The hardware walker consumes real page-directory and page-table frames;
//! everything the VM core needs from it fits behind [`PageTable`]:
//! installing and clearing translations and reading the accessed and dirty
//! bits that the eviction policy and write-back rules depend on.

use crate::sync::mutex::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};
use bitflags::bitflags;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr};

bitflags! {
    /// Status bits of a software page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const WRITABLE = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
    }
}

/// One process's top-level page table, as the MMU sees it.
pub trait PageTable: Send {
    /// Maps user page `va` to the frame at kernel address `kva`.
    ///
    /// Returns `false` if the mapping could not be installed, e.g. because
    /// memory for an intermediate page-table page was unavailable.
    fn set_page(&mut self, va: usize, kva: usize, writable: bool) -> bool;

    /// Removes the translation for `va`, if any.
    fn clear_page(&mut self, va: usize);

    /// Returns the frame `va` translates to, or `None` if not present.
    fn get_page(&self, va: usize) -> Option<usize>;

    fn is_accessed(&self, va: usize) -> bool;
    fn set_accessed(&mut self, va: usize, accessed: bool);
    fn is_dirty(&self, va: usize) -> bool;
    fn set_dirty(&mut self, va: usize, dirty: bool);
}

/// Shared handle to a process's page table.
pub type PageTableRef = Arc<Mutex<dyn PageTable>>;

struct SoftEntry {
    kva: usize,
    flags: PteFlags,
}

/// Software page table standing in for the MMU-walked structures.
///
/// `entry_limit` bounds the number of live translations, which is how
/// running out of memory for page-table pages shows up here.
pub struct SoftPageTable {
    entries: BTreeMap<usize, SoftEntry>,
    entry_limit: Option<usize>,
}

impl SoftPageTable {
    pub fn new() -> SoftPageTable {
        SoftPageTable {
            entries: BTreeMap::new(),
            entry_limit: None,
        }
    }

    pub fn with_entry_limit(entry_limit: usize) -> SoftPageTable {
        SoftPageTable {
            entries: BTreeMap::new(),
            entry_limit: Some(entry_limit),
        }
    }

    pub fn into_ref(self) -> PageTableRef {
        Arc::new(Mutex::new(self))
    }

    /// Number of live translations.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for SoftPageTable {
    fn set_page(&mut self, va: usize, kva: usize, writable: bool) -> bool {
        debug_assert!(is_page_aligned(va));
        debug_assert!(is_page_aligned(kva));
        debug_assert!(is_user_vaddr(va));
        assert!(
            !self.entries.contains_key(&va),
            "remapping a present page at {va:#x}"
        );
        if let Some(limit) = self.entry_limit {
            if self.entries.len() >= limit {
                return false;
            }
        }
        let mut flags = PteFlags::empty();
        flags.set(PteFlags::WRITABLE, writable);
        self.entries.insert(va, SoftEntry { kva, flags });
        true
    }

    fn clear_page(&mut self, va: usize) {
        self.entries.remove(&va);
    }

    fn get_page(&self, va: usize) -> Option<usize> {
        self.entries.get(&va).map(|e| e.kva)
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.entries
            .get(&va)
            .is_some_and(|e| e.flags.contains(PteFlags::ACCESSED))
    }

    fn set_accessed(&mut self, va: usize, accessed: bool) {
        if let Some(entry) = self.entries.get_mut(&va) {
            entry.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.entries
            .get(&va)
            .is_some_and(|e| e.flags.contains(PteFlags::DIRTY))
    }

    fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(entry) = self.entries.get_mut(&va) {
            entry.flags.set(PteFlags::DIRTY, dirty);
        }
    }
}
