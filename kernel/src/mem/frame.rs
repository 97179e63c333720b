//! Frame table: records for the frames of the user pool and the clock
//! victim scan.
//!
//! Frame records are indexed by pool frame, so a frame index and a kernel
//! virtual address identify the same frame. A record holds a non-owning
//! link to its resident descriptor; the descriptor points back by index.
//! The whole table sits behind the VM subsystem's frame lock.

use crate::mem::palloc::UserPool;
use crate::mem::spt::{PageRef, PageWeak};
use crate::paging::PageTable;
use alloc::sync::Arc;
use alloc::vec::Vec;

struct FrameSlot {
    /// Non-owning link to the resident descriptor. Cleared while eviction
    /// I/O is in flight so the scan cannot pick the frame twice.
    page: Option<PageWeak>,
    /// Pinned frames are never selected for eviction.
    pinned: bool,
}

pub(crate) struct FrameTable {
    pool: UserPool,
    slots: Vec<Option<FrameSlot>>,
    /// Clock hand of the victim scan.
    cursor: usize,
}

impl FrameTable {
    pub fn new(pool: UserPool) -> FrameTable {
        let mut slots = Vec::new();
        slots.resize_with(pool.frame_count(), || None);
        FrameTable {
            pool,
            slots,
            cursor: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn kva(&self, index: usize) -> usize {
        self.pool.kva_of(index)
    }

    /// Number of frames currently allocated.
    pub fn used_frames(&self) -> usize {
        self.pool.used_frames()
    }

    /// Allocates a zeroed frame from the user pool, already pinned so it
    /// cannot be evicted before its contents are loaded. Returns `None`
    /// when the pool is exhausted.
    pub fn acquire_pinned(&mut self) -> Option<usize> {
        let kva = self.pool.acquire_zeroed()?;
        let index = self.pool.index_of(kva);
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(FrameSlot {
            page: None,
            pinned: true,
        });
        Some(index)
    }

    /// Returns the frame to the user pool.
    pub fn release(&mut self, index: usize) {
        let slot = self.slots[index].take();
        assert!(slot.is_some(), "releasing an unallocated frame {index}");
        self.pool.release(self.pool.kva_of(index));
    }

    fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        self.slots[index]
            .as_mut()
            .expect("frame is not allocated")
    }

    pub fn link(&mut self, index: usize, page: &PageRef) {
        let slot = self.slot_mut(index);
        debug_assert!(slot.page.is_none());
        slot.page = Some(Arc::downgrade(page));
    }

    pub fn unlink(&mut self, index: usize) {
        self.slot_mut(index).page = None;
    }

    pub fn pin(&mut self, index: usize) {
        self.slot_mut(index).pinned = true;
    }

    pub fn unpin(&mut self, index: usize) {
        self.slot_mut(index).pinned = false;
    }

    #[cfg(test)]
    pub fn is_pinned(&self, index: usize) -> bool {
        self.slots[index].as_ref().is_some_and(|s| s.pinned)
    }

    /// Clock scan with second chance: a frame whose page was accessed since
    /// the hand last passed gets its accessed bit cleared and is skipped;
    /// the first unaccessed, unpinned frame becomes the victim.
    ///
    /// The victim is returned pinned with its page link cleared, so it is
    /// out of consideration while the caller swaps the page out. Returns
    /// `None` after `2 * frame_count` fruitless steps, which only happens
    /// when every frame is pinned or busy.
    pub fn select_victim(&mut self) -> Option<(usize, PageRef)> {
        let frame_count = self.slots.len();
        for _ in 0..2 * frame_count {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % frame_count;

            let page = {
                let Some(slot) = self.slots[index].as_ref() else {
                    continue;
                };
                if slot.pinned {
                    continue;
                }
                let Some(page) = slot.page.as_ref().and_then(PageWeak::upgrade) else {
                    continue;
                };
                page
            };

            // A page mid-operation holds its own lock; treat it as pinned.
            let Some(guard) = page.try_lock() else {
                continue;
            };
            let Some(owner) = guard.owner() else {
                continue;
            };
            let va = guard.va();
            drop(guard);

            let mut pt = owner.lock();
            if pt.is_accessed(va) {
                // second chance
                pt.set_accessed(va, false);
                continue;
            }
            drop(pt);

            let slot = self.slot_mut(index);
            slot.pinned = true;
            slot.page = None;
            return Some((index, page));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page::{Page, PageInit, TargetKind};
    use crate::mem::spt::PageRef;
    use crate::paging::{PageTable, PageTableRef, SoftPageTable};
    use crate::sync::mutex::Mutex;

    /// Builds a table whose every frame holds a resident anonymous page
    /// owned by `pt`.
    fn full_table(frames: usize, pt: &PageTableRef) -> (FrameTable, Vec<PageRef>) {
        let mut table = FrameTable::new(UserPool::new(frames));
        let mut pages = Vec::new();
        for i in 0..frames {
            let va = 0x1000_0000 + i * marrowos_shared::mem::PAGE_FRAME_SIZE;
            let index = table.acquire_pinned().unwrap();
            let page: PageRef = Arc::new(Mutex::new(Page::new_uninit(
                va,
                true,
                TargetKind::Anon,
                PageInit::Zero,
            )));
            page.lock().set_frame(index, pt.clone());
            pt.lock().set_page(va, table.kva(index), true);
            table.link(index, &page);
            table.unpin(index);
            pages.push(page);
        }
        (table, pages)
    }

    #[test]
    fn test_second_chance_prefers_unaccessed() {
        let pt = SoftPageTable::new().into_ref();
        let (mut table, pages) = full_table(3, &pt);

        // frames 0 and 1 recently accessed, frame 2 not
        pt.lock().set_accessed(pages[0].lock().va(), true);
        pt.lock().set_accessed(pages[1].lock().va(), true);

        let (victim, victim_page) = table.select_victim().unwrap();
        assert_eq!(victim, 2);
        assert!(Arc::ptr_eq(&victim_page, &pages[2]));
        assert!(table.is_pinned(victim));

        // the hand cleared the accessed bits it passed over
        assert!(!pt.lock().is_accessed(pages[0].lock().va()));
        assert!(!pt.lock().is_accessed(pages[1].lock().va()));
    }

    #[test]
    fn test_all_accessed_still_finds_a_victim() {
        let pt = SoftPageTable::new().into_ref();
        let (mut table, pages) = full_table(2, &pt);
        for page in &pages {
            pt.lock().set_accessed(page.lock().va(), true);
        }

        // first pass clears bits, second pass selects
        assert!(table.select_victim().is_some());
    }

    #[test]
    fn test_pinned_frames_are_skipped() {
        let pt = SoftPageTable::new().into_ref();
        let (mut table, _pages) = full_table(2, &pt);
        table.pin(0);

        let (victim, _) = table.select_victim().unwrap();
        assert_eq!(victim, 1);
    }

    #[test]
    fn test_all_pinned_yields_no_victim() {
        let pt = SoftPageTable::new().into_ref();
        let (mut table, _pages) = full_table(2, &pt);
        table.pin(0);
        table.pin(1);
        assert!(table.select_victim().is_none());
    }
}
