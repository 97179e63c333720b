//! The virtual-memory subsystem: frame pool, swap allocator, and the
//! claim/evict engine that materializes pages on fault.
//!
//! One `Vm` value exists for the whole kernel, created at boot. The frame
//! table and the eviction hand live behind `frames` (the frame lock); the
//! lock is dropped before any swap or file I/O, with the frame in question
//! pinned so the scan cannot touch it in the meantime.

use crate::block::block_core::Block;
use crate::mem::frame::FrameTable;
use crate::mem::page::{Page, PageInit, PageKind, TargetKind};
use crate::mem::palloc::{frame_slice, UserPool};
use crate::mem::spt::PageRef;
use crate::mem::swap::SwapTable;
use crate::mem::vm_error::{Result, VmError};
use crate::paging::{PageTable, PageTableRef};
use crate::process::{IntrFrame, Process};
use crate::sync::mutex::Mutex;
use alloc::vec::Vec;
use log::{debug, trace};
use marrowos_shared::mem::{
    is_user_vaddr, page_round_down, MAX_STACK_SIZE, PAGE_FRAME_SIZE, USER_STACK,
};

/// Push instructions may fault up to this far below the stack pointer.
const STACK_PUSH_SLACK: usize = 32;

pub struct Vm {
    frames: Mutex<FrameTable>,
    swap: Mutex<SwapTable>,
}

impl Vm {
    /// Initializes the subsystem with `user_frames` frames in the user pool
    /// and `swap_disk` backing anonymous pages.
    pub fn new(swap_disk: Block, user_frames: usize) -> Vm {
        let swap = SwapTable::new(swap_disk);
        debug!(
            "vm: {} user frames, {} swap slots",
            user_frames,
            swap.slot_count()
        );
        Vm {
            frames: Mutex::new(FrameTable::new(UserPool::new(user_frames))),
            swap: Mutex::new(swap),
        }
    }

    /// Number of frames currently allocated from the user pool.
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().used_frames()
    }

    /// Number of swap slots currently in use.
    pub fn used_swap_slots(&self) -> usize {
        self.swap.lock().used_slots()
    }

    /// Creates a lazily initialized page at `va` in `process`'s address
    /// space. The page is materialized by the first fault on it.
    pub fn alloc_page_with_initializer(
        &self,
        process: &mut Process,
        target: TargetKind,
        va: usize,
        writable: bool,
        init: PageInit,
    ) -> Result<()> {
        process
            .spt
            .insert(Page::new_uninit(va, writable, target, init))
            .map(|_| ())
    }

    /// Shorthand for a zero-filled lazy page.
    pub fn alloc_page(
        &self,
        process: &mut Process,
        target: TargetKind,
        va: usize,
        writable: bool,
    ) -> Result<()> {
        self.alloc_page_with_initializer(process, target, va, writable, PageInit::Zero)
    }

    /// Materializes the page at `va` into a frame.
    pub fn claim_page(&self, process: &mut Process, va: usize) -> Result<()> {
        let page = process.spt.find(va).ok_or(VmError::InvalidAccess)?;
        self.do_claim(&process.pagetable, &page)
    }

    /// Classifies and services a page fault. An error means the access was
    /// invalid or could not be satisfied; the caller kills the process.
    pub fn try_handle_fault(
        &self,
        process: &mut Process,
        iframe: &IntrFrame,
        addr: usize,
        user: bool,
        _write: bool,
        not_present: bool,
    ) -> Result<()> {
        if !not_present {
            // protection violation on a present page
            return Err(VmError::InvalidAccess);
        }
        if !is_user_vaddr(addr) {
            return Err(VmError::InvalidAccess);
        }
        let va = page_round_down(addr);

        if let Some(page) = process.spt.find(va) {
            return self.do_claim(&process.pagetable, &page);
        }

        // Faults raised inside a syscall carry the kernel stack pointer;
        // the user one was saved on the way in.
        let rsp = if user { iframe.rsp } else { process.user_rsp };
        if is_valid_stack_access(addr, rsp) {
            trace!("stack growth to {va:#x}");
            self.alloc_page(process, TargetKind::Anon, va, true)?;
            return self.claim_page(process, va);
        }

        Err(VmError::InvalidAccess)
    }

    /// Binds `page` to a frame, installs the hardware mapping, and loads its
    /// contents. Claiming an already resident page is a no-op.
    fn do_claim(&self, pagetable: &PageTableRef, page: &PageRef) -> Result<()> {
        let mut guard = page.lock();
        if guard.is_resident() {
            return Ok(());
        }

        let frame = self.get_frame()?;
        let kva = self.frames.lock().kva(frame);

        {
            let mut frames = self.frames.lock();
            frames.link(frame, page);
            guard.set_frame(frame, pagetable.clone());
        }

        if !pagetable
            .lock()
            .set_page(guard.va(), kva, guard.writable())
        {
            self.abandon_claim(&mut guard, frame);
            return Err(VmError::MapInstall);
        }

        // The frame stays pinned across the load so the scan cannot evict
        // the very page being populated.
        let loaded = {
            // SAFETY: the frame was acquired above and is pinned.
            let bytes = unsafe { frame_slice(kva) };
            let mut swap = self.swap.lock();
            guard.swap_in(bytes, &mut swap)
        };
        if let Err(e) = loaded {
            pagetable.lock().clear_page(guard.va());
            self.abandon_claim(&mut guard, frame);
            return Err(e);
        }

        trace!("claimed {:#x} into frame {frame}", guard.va());
        self.frames.lock().unpin(frame);
        Ok(())
    }

    /// Undoes a half-finished claim: detaches both sides of the page-frame
    /// link and returns the frame to the pool.
    fn abandon_claim(&self, page: &mut Page, frame: usize) {
        let mut frames = self.frames.lock();
        frames.unlink(frame);
        frames.release(frame);
        page.clear_frame();
    }

    /// Obtains a pinned frame, evicting a victim when the pool is dry.
    fn get_frame(&self) -> Result<usize> {
        let (index, victim) = {
            let mut frames = self.frames.lock();
            if let Some(index) = frames.acquire_pinned() {
                return Ok(index);
            }
            frames.select_victim().ok_or(VmError::OutOfFrames)?
        };
        // Frame lock dropped for the eviction I/O; the victim frame is
        // pinned and unlinked, so no one else will be handed it.
        match self.evict(index, &victim) {
            Ok(()) => Ok(index),
            Err(e) => {
                let mut frames = self.frames.lock();
                frames.link(index, &victim);
                frames.unpin(index);
                Err(e)
            }
        }
    }

    /// Swaps the victim page out and detaches it from its frame, leaving
    /// the frame ready for reuse.
    fn evict(&self, index: usize, victim: &PageRef) -> Result<()> {
        let mut guard = victim.lock();
        let owner = guard.owner().expect("resident page with no owner");
        let kva = self.frames.lock().kva(index);
        debug!("evicting {:#x} from frame {index}", guard.va());

        {
            // SAFETY: the victim frame is pinned and its contents are
            // quiescent: the hardware mapping is removed below, and the
            // owner is not running while its fault handler evicts.
            let bytes = unsafe { frame_slice(kva) };
            let mut pt = owner.lock();
            let mut swap = self.swap.lock();
            guard.swap_out(bytes, &mut *pt, &mut swap)?;
        }

        owner.lock().clear_page(guard.va());
        guard.clear_frame();
        Ok(())
    }

    /// Destroys one descriptor: dirty write-back for file pages, swap-slot
    /// release for anonymous ones, and the frame itself if resident.
    pub(crate) fn destroy_page(&self, pagetable: &PageTableRef, page: &PageRef) -> Result<()> {
        let mut guard = page.lock();
        let frame = guard.frame();
        let kva = frame.map(|index| self.frames.lock().kva(index));

        let result = {
            // SAFETY: the descriptor is being torn down by its owner; the
            // frame, if any, is not shared.
            let resident = kva.map(|kva| unsafe { &*frame_slice(kva) });
            let mut pt = pagetable.lock();
            let mut swap = self.swap.lock();
            guard.destroy(resident, &mut *pt, &mut swap)
        };

        if let Some(index) = frame {
            pagetable.lock().clear_page(guard.va());
            let mut frames = self.frames.lock();
            frames.unlink(index);
            frames.release(index);
            guard.clear_frame();
        }
        result
    }

    /// Duplicates `src`'s address space into `dst` at fork time.
    ///
    /// Uninitialized pages keep their lazy initializer (with a reopened file
    /// handle); anonymous pages are copied eagerly into fresh frames;
    /// file-backed pages are recreated as lazy mappings over a reopened
    /// handle.
    pub fn spt_copy(&self, dst: &mut Process, src: &mut Process) -> Result<()> {
        enum Plan {
            Insert(Page),
            CopyAnon { writable: bool },
        }

        let entries: Vec<(usize, PageRef)> = src.spt.iter().collect();
        for (va, src_page) in entries {
            let plan = {
                let guard = src_page.lock();
                match guard.kind() {
                    PageKind::Uninit(uninit) => Plan::Insert(Page::new_uninit(
                        va,
                        guard.writable(),
                        uninit.target,
                        uninit.init.duplicate(),
                    )),
                    PageKind::Anon(_) => Plan::CopyAnon {
                        writable: guard.writable(),
                    },
                    PageKind::File(file_page) => Plan::Insert(Page::new_uninit(
                        va,
                        guard.writable(),
                        TargetKind::File,
                        PageInit::File(file_page.reload()),
                    )),
                }
            };

            match plan {
                Plan::Insert(page) => {
                    dst.spt.insert(page)?;
                }
                Plan::CopyAnon { writable } => {
                    self.alloc_page(dst, TargetKind::Anon, va, writable)?;
                    self.claim_page(dst, va)?;
                    let dst_page = dst.spt.find(va).expect("page was just inserted");
                    let dst_frame = dst_page.lock().frame().expect("page was just claimed");

                    // Keep the child's frame from being chosen as the victim
                    // while the parent's copy is pulled back in.
                    self.frames.lock().pin(dst_frame);
                    let copied = self.copy_resident(&src.pagetable, &src_page, dst_frame);
                    self.frames.lock().unpin(dst_frame);
                    copied?;
                }
            }
        }
        Ok(())
    }

    /// Copies the contents of `src_page` (claiming it back in if swapped
    /// out) into the frame at `dst_frame`.
    fn copy_resident(
        &self,
        src_pagetable: &PageTableRef,
        src_page: &PageRef,
        dst_frame: usize,
    ) -> Result<()> {
        self.do_claim(src_pagetable, src_page)?;
        let src_frame = src_page.lock().frame().expect("page was just claimed");
        let (src_kva, dst_kva) = {
            let frames = self.frames.lock();
            (frames.kva(src_frame), frames.kva(dst_frame))
        };
        // SAFETY: both frames are allocated and distinct.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src_kva as *const u8,
                dst_kva as *mut u8,
                PAGE_FRAME_SIZE,
            );
        }
        Ok(())
    }

    /// Tears down every descriptor in `process`'s address space: dirty
    /// file-backed pages are written back, swap slots and frames released.
    pub fn spt_kill(&self, process: &mut Process) {
        let entries: Vec<(usize, PageRef)> = process.spt.iter().collect();
        for (va, page) in entries {
            if let Err(e) = self.destroy_page(&process.pagetable, &page) {
                // Losing a dirty page at exit is not fatal to teardown.
                debug!("write-back of {va:#x} failed during teardown: {e}");
            }
        }
        process.spt.clear();
    }
}

/// A fault below the stack qualifies for stack growth if it is at most the
/// push slack below the stack pointer and the stack stays within its limit.
fn is_valid_stack_access(addr: usize, rsp: usize) -> bool {
    if addr >= USER_STACK {
        return false;
    }
    if addr < rsp.saturating_sub(STACK_PUSH_SLACK) {
        return false;
    }
    if USER_STACK - addr > MAX_STACK_SIZE {
        return false;
    }
    true
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::block::block_core::test::scratch_block;
    use crate::mem::swap::SECTORS_PER_PAGE;
    use crate::mem::user::{copy_from_user, copy_to_user};
    use crate::paging::SoftPageTable;
    use crate::process::Pid;
    use alloc::vec::Vec;

    pub fn test_vm(user_frames: usize, swap_slots: usize) -> Vm {
        Vm::new(scratch_block(swap_slots * SECTORS_PER_PAGE), user_frames)
    }

    pub fn test_process(pid: Pid) -> Process {
        Process::new(pid, SoftPageTable::new().into_ref())
    }

    pub fn write_user(vm: &Vm, process: &mut Process, va: usize, bytes: &[u8]) {
        copy_to_user(vm, process, va, bytes).unwrap();
    }

    pub fn read_user(vm: &Vm, process: &mut Process, va: usize, len: usize) -> Vec<u8> {
        copy_from_user(vm, process, va, len).unwrap()
    }

    fn fault(vm: &Vm, process: &mut Process, addr: usize, rsp: usize) -> Result<()> {
        vm.try_handle_fault(process, &IntrFrame { rsp }, addr, true, true, true)
    }

    #[test]
    fn test_lazy_stack_page_is_zeroed_then_holds_writes() {
        let vm = test_vm(4, 8);
        let mut process = test_process(1);

        let va = USER_STACK - 4;
        assert_eq!(read_user(&vm, &mut process, va, 4), [0, 0, 0, 0]);
        write_user(&vm, &mut process, va, &[0xab]);
        assert_eq!(read_user(&vm, &mut process, va, 1), [0xab]);
    }

    #[test]
    fn test_stack_growth_boundaries() {
        let rsp = USER_STACK - 0x2000;
        let accepted = |addr: usize, rsp: usize| {
            let vm = test_vm(2, 2);
            let mut process = test_process(1);
            fault(&vm, &mut process, addr, rsp).is_ok()
        };

        assert!(accepted(rsp - 8, rsp));
        assert!(accepted(rsp - 32, rsp));
        assert!(!accepted(rsp - 33, rsp));

        let low = USER_STACK - (MAX_STACK_SIZE - 1);
        assert!(accepted(low, low));
        let too_low = USER_STACK - MAX_STACK_SIZE - 1;
        assert!(!accepted(too_low, too_low));
    }

    #[test]
    fn test_fault_above_user_space_rejected() {
        let vm = test_vm(2, 2);
        let mut process = test_process(1);
        assert_eq!(
            fault(&vm, &mut process, USER_STACK, USER_STACK),
            Err(VmError::InvalidAccess)
        );
    }

    #[test]
    fn test_protection_fault_rejected() {
        let vm = test_vm(2, 2);
        let mut process = test_process(1);
        let va = 0x1000_0000;
        vm.alloc_page(&mut process, TargetKind::Anon, va, false)
            .unwrap();
        vm.claim_page(&mut process, va).unwrap();

        // present page, not_present = false: a write to a read-only page
        let result = vm.try_handle_fault(
            &mut process,
            &IntrFrame { rsp: USER_STACK },
            va,
            true,
            true,
            false,
        );
        assert_eq!(result, Err(VmError::InvalidAccess));
    }

    #[test]
    fn test_claiming_a_resident_page_is_a_noop() {
        let vm = test_vm(2, 2);
        let mut process = test_process(1);
        let va = 0x1000_0000;
        vm.alloc_page(&mut process, TargetKind::Anon, va, true)
            .unwrap();

        write_user(&vm, &mut process, va, &[7]);
        let frame = process.spt.find(va).unwrap().lock().frame();
        vm.claim_page(&mut process, va).unwrap();
        assert_eq!(process.spt.find(va).unwrap().lock().frame(), frame);
        assert_eq!(read_user(&vm, &mut process, va, 1), [7]);
    }

    #[test]
    fn test_duplicate_alloc_rejected() {
        let vm = test_vm(2, 2);
        let mut process = test_process(1);
        let va = 0x1000_0000;
        vm.alloc_page(&mut process, TargetKind::Anon, va, true)
            .unwrap();
        assert_eq!(
            vm.alloc_page(&mut process, TargetKind::Anon, va, true),
            Err(VmError::AlreadyMapped)
        );
    }

    #[test]
    fn test_eviction_preserves_page_contents() {
        let frames = 4;
        let vm = test_vm(frames, 32);
        let mut process = test_process(1);
        let base = 0x1000_0000;
        let pages = frames + 10;

        for i in 0..pages {
            let va = base + i * PAGE_FRAME_SIZE;
            vm.alloc_page(&mut process, TargetKind::Anon, va, true)
                .unwrap();
            let pattern = [i as u8; 64];
            write_user(&vm, &mut process, va, &pattern);
        }
        assert!(vm.resident_frames() <= frames);
        assert!(vm.used_swap_slots() >= pages - frames);

        // an anonymous page holds a swap slot exactly while non-resident
        for (_va, page) in process.spt.iter() {
            let guard = page.lock();
            if let PageKind::Anon(anon) = guard.kind() {
                assert_eq!(anon.swap_slot().is_some(), !guard.is_resident());
            }
        }

        for i in 0..pages {
            let va = base + i * PAGE_FRAME_SIZE;
            assert_eq!(
                read_user(&vm, &mut process, va, 64),
                [i as u8; 64],
                "page {i} lost its contents"
            );
        }
    }

    #[test]
    fn test_residency_matches_hardware_mappings() {
        let vm = test_vm(2, 8);
        let mut process = test_process(1);
        let base = 0x1000_0000;
        for i in 0..4 {
            let va = base + i * PAGE_FRAME_SIZE;
            vm.alloc_page(&mut process, TargetKind::Anon, va, true)
                .unwrap();
            write_user(&vm, &mut process, va, &[i as u8]);
        }

        for (va, page) in process.spt.iter() {
            let resident = page.lock().is_resident();
            let mapped = process.pagetable.lock().get_page(va).is_some();
            assert_eq!(resident, mapped, "page {va:#x}");
        }
    }

    #[test]
    fn test_fork_keeps_anonymous_pages_isolated() {
        let vm = test_vm(4, 8);
        let mut parent = test_process(1);
        let mut child = test_process(2);
        let va = 0x1000_0000;

        vm.alloc_page(&mut parent, TargetKind::Anon, va, true)
            .unwrap();
        write_user(&vm, &mut parent, va, b"P");
        vm.spt_copy(&mut child, &mut parent).unwrap();

        write_user(&vm, &mut child, va, b"C");
        assert_eq!(read_user(&vm, &mut parent, va, 1), b"P");
        assert_eq!(read_user(&vm, &mut child, va, 1), b"C");
    }

    #[test]
    fn test_fork_copies_swapped_out_pages() {
        // two frames, three pages: one parent page is on swap at fork time
        let vm = test_vm(2, 8);
        let mut parent = test_process(1);
        let base = 0x1000_0000;
        for i in 0..3 {
            let va = base + i * PAGE_FRAME_SIZE;
            vm.alloc_page(&mut parent, TargetKind::Anon, va, true)
                .unwrap();
            write_user(&vm, &mut parent, va, &[0x50 + i as u8]);
        }
        assert!(vm.used_swap_slots() >= 1);

        let mut child = test_process(2);
        vm.spt_copy(&mut child, &mut parent).unwrap();
        for i in 0..3 {
            let va = base + i * PAGE_FRAME_SIZE;
            assert_eq!(read_user(&vm, &mut child, va, 1), [0x50 + i as u8]);
            assert_eq!(read_user(&vm, &mut parent, va, 1), [0x50 + i as u8]);
        }
    }

    #[test]
    fn test_out_of_swap_propagates() {
        let vm = test_vm(2, 1);
        let mut process = test_process(1);
        let base = 0x1000_0000;
        for i in 0..3 {
            let va = base + i * PAGE_FRAME_SIZE;
            vm.alloc_page(&mut process, TargetKind::Anon, va, true)
                .unwrap();
            write_user(&vm, &mut process, va, &[i as u8]);
        }
        // the single swap slot is taken; the next eviction cannot spill
        assert_eq!(vm.used_swap_slots(), 1);

        let va = base + 3 * PAGE_FRAME_SIZE;
        vm.alloc_page(&mut process, TargetKind::Anon, va, true)
            .unwrap();
        assert_eq!(
            copy_to_user(&vm, &mut process, va, &[3]),
            Err(VmError::OutOfSwap)
        );
    }

    #[test]
    fn test_failed_map_install_releases_the_frame() {
        let vm = test_vm(2, 2);
        let mut process = Process::new(1, SoftPageTable::with_entry_limit(0).into_ref());
        let va = 0x1000_0000;
        vm.alloc_page(&mut process, TargetKind::Anon, va, true)
            .unwrap();
        assert_eq!(vm.claim_page(&mut process, va), Err(VmError::MapInstall));
        assert_eq!(vm.resident_frames(), 0);
        assert!(!process.spt.find(va).unwrap().lock().is_resident());
    }

    #[test]
    fn test_spt_kill_releases_frames_and_slots() {
        let vm = test_vm(2, 8);
        let mut process = test_process(1);
        let base = 0x1000_0000;
        for i in 0..4 {
            let va = base + i * PAGE_FRAME_SIZE;
            vm.alloc_page(&mut process, TargetKind::Anon, va, true)
                .unwrap();
            write_user(&vm, &mut process, va, &[i as u8]);
        }
        assert!(vm.resident_frames() > 0);
        assert!(vm.used_swap_slots() > 0);

        vm.spt_kill(&mut process);
        assert!(process.spt.is_empty());
        assert_eq!(vm.resident_frames(), 0);
        assert_eq!(vm.used_swap_slots(), 0);
        assert_eq!(process.pagetable.lock().get_page(base), None);
    }
}
