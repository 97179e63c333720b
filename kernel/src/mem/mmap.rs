//! File-backed memory mappings.
//!
//! `mmap` carves a user range into lazily loaded file pages and records a
//! region so `munmap` can find them again; `munmap` writes dirty pages back
//! and drops the region's file handle.

use crate::fs::File;
use crate::mem::page::{FileLoad, PageInit, TargetKind};
use crate::mem::vm::Vm;
use crate::process::Process;
use log::debug;
use marrowos_shared::mem::{is_page_aligned, is_user_vaddr, PAGE_FRAME_SIZE};

/// Bookkeeping for one mapped range.
pub struct MmapRegion {
    start_addr: usize,
    page_count: usize,
    /// Independent handle keeping the backing file open for the lifetime of
    /// the mapping.
    file: File,
}

impl MmapRegion {
    pub fn start_addr(&self) -> usize {
        self.start_addr
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }
}

impl Vm {
    /// Maps `length` bytes of `file` starting at byte `offset` into
    /// `process`'s address space at `addr`.
    ///
    /// Returns the mapped address, or `None` if any precondition fails:
    /// `addr` must be nonzero, page-aligned and, with the end of the range,
    /// a user address; `length` must be nonzero; `offset` must be
    /// page-aligned; the file must be nonempty; and no page in the range may
    /// already be mapped.
    pub fn mmap(
        &self,
        process: &mut Process,
        addr: usize,
        length: usize,
        writable: bool,
        file: &File,
        offset: u64,
    ) -> Option<usize> {
        if addr == 0 || !is_page_aligned(addr) {
            return None;
        }
        if length == 0 {
            return None;
        }
        if offset % PAGE_FRAME_SIZE as u64 != 0 {
            return None;
        }
        let file_len = file.length();
        if file_len == 0 {
            return None;
        }
        let end = addr.checked_add(length)?;
        if !is_user_vaddr(addr) || !is_user_vaddr(end - 1) {
            return None;
        }

        let page_count = length.div_ceil(PAGE_FRAME_SIZE);
        for i in 0..page_count {
            if process.spt.find(addr + i * PAGE_FRAME_SIZE).is_some() {
                return None;
            }
        }

        let mapped = file.reopen();
        let mut remaining = length;
        let mut file_remaining = file_len.saturating_sub(offset) as usize;
        let mut current_offset = offset;

        for i in 0..page_count {
            let page_addr = addr + i * PAGE_FRAME_SIZE;
            let read_bytes = remaining.min(file_remaining).min(PAGE_FRAME_SIZE);
            let load = FileLoad {
                file: mapped.reopen(),
                offset: current_offset,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            };
            if self
                .alloc_page_with_initializer(
                    process,
                    TargetKind::File,
                    page_addr,
                    writable,
                    PageInit::File(load),
                )
                .is_err()
            {
                // Roll back the descriptors inserted so far; the reopened
                // handle is dropped on return.
                for j in 0..i {
                    if let Some(page) = process.spt.remove(addr + j * PAGE_FRAME_SIZE) {
                        let _ = self.destroy_page(&process.pagetable, &page);
                    }
                }
                return None;
            }
            current_offset += read_bytes as u64;
            remaining -= read_bytes;
            file_remaining -= read_bytes;
        }

        debug!("mmap {addr:#x}, {page_count} pages");
        process.mmap_regions.push(MmapRegion {
            start_addr: addr,
            page_count,
            file: mapped,
        });
        Some(addr)
    }

    /// Removes the mapping whose range starts at exactly `addr`, writing
    /// dirty pages back to the file. Unknown addresses are ignored.
    pub fn munmap(&self, process: &mut Process, addr: usize) {
        let Some(pos) = process
            .mmap_regions
            .iter()
            .position(|region| region.start_addr == addr)
        else {
            return;
        };
        let region = process.mmap_regions.remove(pos);
        debug!("munmap {addr:#x}, {} pages", region.page_count);

        for i in 0..region.page_count {
            let page_addr = addr + i * PAGE_FRAME_SIZE;
            if let Some(page) = process.spt.remove(page_addr) {
                if let Err(e) = self.destroy_page(&process.pagetable, &page) {
                    debug!("write-back of {page_addr:#x} failed during munmap: {e}");
                }
            }
        }
        // dropping the region closes its file handle
    }
}
