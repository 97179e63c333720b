//! Page descriptors.
//!
//! A page starts out uninitialized and becomes anonymous or file-backed on
//! its first fault, keeping its identity (and its slot in the supplemental
//! page table) across the transition. The kind-specific behavior of
//! `swap_in`, `swap_out` and `destroy` is dispatched by matching on
//! [`PageKind`].

use crate::fs::File;
use crate::mem::swap::{SwapSlot, SwapTable};
use crate::mem::vm_error::Result;
use crate::paging::{PageTable, PageTableRef};
use marrowos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// The kind a lazily created page assumes on its first fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Anon,
    File,
}

/// Deferred initializer run on the first fault of an uninitialized page.
pub enum PageInit {
    /// Fill the page with zeros (stacks, heaps, bss).
    Zero,
    /// Read part of a file, zero the tail (segments and mappings).
    File(FileLoad),
}

impl PageInit {
    /// Initializer for the same content over an independent file handle.
    pub fn duplicate(&self) -> PageInit {
        match self {
            PageInit::Zero => PageInit::Zero,
            PageInit::File(load) => PageInit::File(load.duplicate()),
        }
    }
}

/// Lazy file read: `read_bytes` bytes at `offset`, then `zero_bytes` of
/// zeros filling out the page.
pub struct FileLoad {
    pub file: File,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileLoad {
    pub fn duplicate(&self) -> FileLoad {
        FileLoad {
            file: self.file.reopen(),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    fn load(&self, page: &mut [u8]) -> Result<()> {
        let n = self.file.read_at(self.offset, &mut page[..self.read_bytes])?;
        page[n..].fill(0);
        Ok(())
    }
}

pub struct UninitPage {
    pub target: TargetKind,
    pub init: PageInit,
}

pub struct AnonPage {
    /// Held while the page is swapped out; a resident page holds no slot.
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn swap_slot(&self) -> Option<&SwapSlot> {
        self.slot.as_ref()
    }
}

pub struct FilePage {
    file: File,
    offset: u64,
    read_bytes: usize,
}

impl FilePage {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Initializer recreating this mapping over an independent file handle.
    pub fn reload(&self) -> FileLoad {
        FileLoad {
            file: self.file.reopen(),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: PAGE_FRAME_SIZE - self.read_bytes,
        }
    }
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// One user virtual page.
pub struct Page {
    va: usize,
    writable: bool,
    kind: PageKind,
    /// Index of the resident frame in the frame table.
    frame: Option<usize>,
    /// Page table of the owning process, set while resident.
    owner: Option<PageTableRef>,
}

impl Page {
    pub fn new_uninit(va: usize, writable: bool, target: TargetKind, init: PageInit) -> Page {
        assert!(is_page_aligned(va));
        assert!(
            !(target == TargetKind::File && matches!(init, PageInit::Zero)),
            "file-backed page without a file initializer"
        );
        Page {
            va,
            writable,
            kind: PageKind::Uninit(UninitPage { target, init }),
            frame: None,
            owner: None,
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn owner(&self) -> Option<PageTableRef> {
        self.owner.clone()
    }

    pub(crate) fn set_frame(&mut self, index: usize, owner: PageTableRef) {
        debug_assert!(self.frame.is_none());
        self.frame = Some(index);
        self.owner = Some(owner);
    }

    pub(crate) fn clear_frame(&mut self) {
        self.frame = None;
        self.owner = None;
    }

    /// Loads the page's contents into its freshly acquired frame.
    ///
    /// For an uninitialized page this runs the lazy initializer and rewrites
    /// the kind in place; for an anonymous page it pulls the contents back
    /// from swap and releases the slot; for a file-backed page it rereads
    /// the backing file.
    pub(crate) fn swap_in(&mut self, page: &mut [u8], swap: &mut SwapTable) -> Result<()> {
        if matches!(self.kind, PageKind::Uninit(_)) {
            return self.first_load(page);
        }
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!(),
            PageKind::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    if let Err(e) = swap.read_into(&slot, page) {
                        anon.slot = Some(slot);
                        return Err(e);
                    }
                    swap.release(slot);
                }
                Ok(())
            }
            PageKind::File(file_page) => {
                let n = file_page
                    .file
                    .read_at(file_page.offset, &mut page[..file_page.read_bytes])?;
                page[n..].fill(0);
                Ok(())
            }
        }
    }

    /// First-fault path: runs the initializer, then transitions the
    /// descriptor to its target kind without changing its identity.
    fn first_load(&mut self, page: &mut [u8]) -> Result<()> {
        let placeholder = PageKind::Anon(AnonPage { slot: None });
        let PageKind::Uninit(uninit) = core::mem::replace(&mut self.kind, placeholder) else {
            unreachable!("first_load on an initialized page");
        };
        match uninit.init {
            PageInit::Zero => {
                page.fill(0);
                // kind is already the resident anonymous page
                Ok(())
            }
            PageInit::File(load) => {
                if let Err(e) = load.load(page) {
                    self.kind = PageKind::Uninit(UninitPage {
                        target: uninit.target,
                        init: PageInit::File(load),
                    });
                    return Err(e);
                }
                if uninit.target == TargetKind::File {
                    self.kind = PageKind::File(FilePage {
                        read_bytes: load.read_bytes,
                        offset: load.offset,
                        file: load.file,
                    });
                }
                Ok(())
            }
        }
    }

    /// Persists the page's contents ahead of its frame being reclaimed.
    ///
    /// Anonymous pages take a swap slot; file-backed pages write dirty
    /// contents back to the file.
    pub(crate) fn swap_out(
        &mut self,
        page: &[u8],
        pt: &mut dyn PageTable,
        swap: &mut SwapTable,
    ) -> Result<()> {
        match &mut self.kind {
            PageKind::Uninit(_) => unreachable!("uninitialized pages are never resident"),
            PageKind::Anon(anon) => {
                debug_assert!(anon.slot.is_none());
                let slot = swap.allocate()?;
                if let Err(e) = swap.write_from(&slot, page) {
                    swap.release(slot);
                    return Err(e);
                }
                anon.slot = Some(slot);
                Ok(())
            }
            PageKind::File(file_page) => {
                if pt.is_dirty(self.va) {
                    file_page
                        .file
                        .write_at(file_page.offset, &page[..file_page.read_bytes])?;
                    pt.set_dirty(self.va, false);
                }
                Ok(())
            }
        }
    }

    /// Releases kind-owned resources. `resident` carries the frame contents
    /// when the page currently holds one, so dirty file-backed pages can be
    /// written back.
    pub(crate) fn destroy(
        &mut self,
        resident: Option<&[u8]>,
        pt: &mut dyn PageTable,
        swap: &mut SwapTable,
    ) -> Result<()> {
        match &mut self.kind {
            PageKind::Uninit(_) => Ok(()),
            PageKind::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    swap.release(slot);
                }
                Ok(())
            }
            PageKind::File(file_page) => {
                if let Some(page) = resident {
                    if pt.is_dirty(self.va) {
                        file_page
                            .file
                            .write_at(file_page.offset, &page[..file_page.read_bytes])?;
                        pt.set_dirty(self.va, false);
                    }
                }
                Ok(())
            }
        }
    }
}
