//! The address-space manager: everything built on top of the raw
//! page-table engine in `pagetable` to give a process its user
//! memory — lazy growth, copy-on-write fork, the fault repair both
//! rely on, and the per-process kernel shadow (`kvm`) that mirrors it.

use crate::kalloc::{self, Page};
use crate::kvm::ProcKernelPageTable;
use crate::pagetable::PageTable;
use crate::param::NVMA;
use crate::riscv::{self, PteFlags, PGSIZE};
use crate::vma::Vma;
use crate::{KernError, KernResult};

/// One process's user memory: its page table, how much of low memory
/// is claimed (`sz`, possibly lazily — not every page below `sz` is
/// necessarily mapped yet), its table of active `mmap` regions, the
/// virtual address of its user stack page, and the kernel shadow
/// table that mirrors it (absent until the embedding kernel installs
/// one via `install_kernel_pagetable`).
pub struct AddressSpace {
    pagetable: PageTable,
    sz: usize,
    pub(crate) vmas: [Option<Vma>; NVMA],
    pub(crate) vma_bound: usize,
    ustack: usize,
    kernel_pagetable: Option<ProcKernelPageTable>,
}

impl AddressSpace {
    pub fn new() -> KernResult<AddressSpace> {
        Ok(AddressSpace {
            pagetable: PageTable::new()?,
            sz: 0,
            vmas: [const { None }; NVMA],
            vma_bound: riscv::TRAPFRAME,
            ustack: riscv::USERSTACK,
            kernel_pagetable: None,
        })
    }

    pub fn pagetable(&self) -> &PageTable {
        &self.pagetable
    }

    pub(crate) fn pagetable_mut(&mut self) -> &mut PageTable {
        &mut self.pagetable
    }

    pub fn size(&self) -> usize {
        self.sz
    }

    pub(crate) fn set_size(&mut self, sz: usize) {
        self.sz = sz;
    }

    pub fn ustack(&self) -> usize {
        self.ustack
    }

    /// Relocates this address space's user stack page, for a loader
    /// that doesn't place it at the default `riscv::USERSTACK` slot.
    pub fn set_ustack(&mut self, va: usize) {
        self.ustack = va;
    }

    pub fn kernel_pagetable(&self) -> Option<&ProcKernelPageTable> {
        self.kernel_pagetable.as_ref()
    }

    /// Attaches a kernel shadow table built via `kvm::ProcKernelPageTable::new`.
    /// Once installed, lazy heap growth keeps it mirrored automatically.
    pub fn install_kernel_pagetable(&mut self, kpt: ProcKernelPageTable) {
        self.kernel_pagetable = Some(kpt);
    }

    /// Maps one page of executable code at virtual address zero —
    /// the very first instructions a brand-new process runs.
    ///
    /// # Panics
    /// If `init_code` doesn't fit in a single page.
    pub fn uvminit(&mut self, init_code: &[u8]) -> KernResult<()> {
        assert!(init_code.len() <= PGSIZE, "uvminit: init code larger than one page");
        let page = kalloc::kalloc().ok_or(KernError::OutOfMemory)?;
        page.0[..init_code.len()].copy_from_slice(init_code);
        page.0[init_code.len()..].fill(0);
        let pa = page as *mut Page as usize;
        self.pagetable
            .mappages(0, pa, PGSIZE, PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U)?;
        self.sz = PGSIZE;
        Ok(())
    }

    /// Grows user memory from `oldsz` to `newsz`, allocating and
    /// mapping one page at a time. A page that's still shared
    /// copy-on-write from a parent's fork is given a private copy
    /// instead of a second mapping, the same repair a write fault to
    /// that page would trigger. Every freshly mapped page gets the
    /// fixed `U|R|W|X` permission set spec.md §4.3.1 mandates — there
    /// is no caller-supplied permission here, matching the original's
    /// `mappages(..., PTE_W|PTE_X|PTE_R|PTE_U)` call.
    ///
    /// On partial failure, everything allocated so far is unwound and
    /// `sz` is left unchanged.
    pub fn uvmalloc(&mut self, oldsz: usize, newsz: usize) -> KernResult<usize> {
        if newsz < oldsz {
            return Ok(oldsz);
        }
        let mut a = riscv::pgroundup(oldsz);
        while a < newsz {
            if let Some(pte) = self.pagetable.pte_at(a) {
                if pte.is_valid() && pte.flags().contains(PteFlags::C) {
                    self.resolve_cow(a)?;
                    a += PGSIZE;
                    continue;
                }
            }
            if let Err(e) = self.map_one_page(a) {
                self.dealloc(a, oldsz);
                return Err(e);
            }
            a += PGSIZE;
        }
        self.sz = newsz;
        Ok(newsz)
    }

    /// Allocates and maps a single zeroed page at `va` with the fixed
    /// `U|R|W|X` permission set, shared by `uvmalloc`'s growth loop and
    /// by `page_fault_handler`'s lazy and `mmap` fault-service paths
    /// alike (the `mmap` path immediately narrows the permission down
    /// to the region's own `prot` in `load_vma`). On mapping failure
    /// the freshly allocated frame is returned to the allocator before
    /// the error propagates.
    fn map_one_page(&mut self, va: usize) -> KernResult<usize> {
        let page = kalloc::kalloc().ok_or(KernError::OutOfMemory)?;
        page.0.fill(0);
        let pa = page as *mut Page as usize;
        let flags = PteFlags::V | PteFlags::U | PteFlags::R | PteFlags::W | PteFlags::X;
        if let Err(e) = self.pagetable.mappages(va, pa, PGSIZE, flags) {
            kalloc::kfree(unsafe { &mut *(pa as *mut Page) });
            return Err(e);
        }
        Ok(pa)
    }

    /// Shrinks user memory from `oldsz` down to `newsz`, freeing every
    /// page that falls out of range.
    pub fn dealloc(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let lo = riscv::pgroundup(newsz);
        let hi = riscv::pgroundup(oldsz);
        if hi > lo {
            self.pagetable.unmap(lo, (hi - lo) / PGSIZE, true);
        }
        self.sz = newsz;
        newsz
    }

    /// Gives a copy-on-write page its own private frame: allocates a
    /// fresh page, copies the old contents over, drops the shared
    /// frame's reference count, and installs the new frame writable.
    /// If a kernel shadow is attached, its stale mirror of the old
    /// frame is unmapped first and the new one remapped after, since
    /// `kvm::ProcKernelPageTable::sync_user_mapping`'s growth path
    /// refuses to remap an address it already shadows.
    fn resolve_cow(&mut self, va: usize) -> KernResult<()> {
        let va = riscv::pgrounddown(va);
        let pte = self.pagetable.pte_at(va).ok_or(KernError::BadAddress)?;
        assert!(pte.flags().contains(PteFlags::C), "resolve_cow: {va:#x} is not copy-on-write");
        let old_pa = pte.pa();
        let new_page = kalloc::kalloc().ok_or(KernError::OutOfMemory)?;
        let new_pa = new_page as *mut Page as usize;
        unsafe {
            core::ptr::copy_nonoverlapping(old_pa as *const u8, new_pa as *mut u8, PGSIZE);
        }
        kalloc::kfree(unsafe { &mut *(old_pa as *mut Page) });
        let flags = riscv::cow_wflags(pte.flags());

        if let Some(shadow) = self.kernel_pagetable.as_mut() {
            shadow.sync_user_mapping(va + PGSIZE, va, self.sz, self.vma_bound, &self.pagetable);
        }
        self.pagetable.set_pte(va, new_pa, flags);
        if let Some(shadow) = self.kernel_pagetable.as_mut() {
            shadow.sync_user_mapping(va, va + PGSIZE, self.sz, self.vma_bound, &self.pagetable);
        }
        Ok(())
    }

    /// Shares `[begin, end)` between `self` and `dst`: the user stack
    /// page is given an eager private copy (it's about to be written
    /// by the child immediately on return from fork, so sharing it
    /// would just force an instant fault), and everything else becomes
    /// copy-on-write in both address spaces with its frame's reference
    /// count bumped once per new owner.
    pub fn copy_range(&mut self, dst: &mut AddressSpace, begin: usize, end: usize) -> KernResult<()> {
        let mut va = riscv::pgrounddown(begin);
        while va < end {
            let Some(pte) = self.pagetable.pte_at(va) else {
                va += PGSIZE;
                continue;
            };
            if !pte.is_valid() {
                va += PGSIZE;
                continue;
            }
            let pa = pte.pa();
            if va == self.ustack {
                let new_page = kalloc::kalloc().ok_or(KernError::OutOfMemory)?;
                let new_pa = new_page as *mut Page as usize;
                unsafe {
                    core::ptr::copy_nonoverlapping(pa as *const u8, new_pa as *mut u8, PGSIZE);
                }
                dst.pagetable.mappages(va, new_pa, PGSIZE, pte.flags())?;
            } else {
                let shared_flags = riscv::cow_flags(pte.flags());
                self.pagetable.set_pte(va, pa, shared_flags);
                dst.pagetable.mappages(va, pa, PGSIZE, shared_flags)?;
                kalloc::kreflock(pa);
                kalloc::inc_refcount(pa);
                kalloc::krefunlock(pa);
            }
            va += PGSIZE;
        }
        Ok(())
    }

    /// Duplicates the whole of this address space's low memory
    /// (`[0, sz)`) into `dst`, for `fork`.
    pub fn uvmcopy(&mut self, dst: &mut AddressSpace) -> KernResult<()> {
        let sz = self.sz;
        self.copy_range(dst, 0, sz)
    }

    /// Revokes user access to the page at `va` without unmapping it —
    /// used to turn the page just below the user stack into a guard
    /// page a stack overflow will fault against.
    pub fn uvmclear(&mut self, va: usize) {
        let va = riscv::pgrounddown(va);
        let pte = self.pagetable.pte_at(va).expect("uvmclear: no mapping to clear");
        let flags = pte.flags() - PteFlags::U;
        self.pagetable.set_pte(va, pte.pa(), flags);
    }

    /// Copies `src` into user memory starting at `dstva`, repairing a
    /// copy-on-write page first if necessary. Any destination byte
    /// that lands in a `MAP_SHARED` `mmap` region has its leaf's
    /// software dirty bit set, which is what `vma`'s writeback checks
    /// before flushing a page back to its file.
    pub fn copyout(&mut self, dstva: usize, src: &[u8]) -> KernResult<()> {
        let mut remaining = src;
        let mut va = dstva;
        while !remaining.is_empty() {
            let page_base = riscv::pgrounddown(va);
            let page_off = va - page_base;
            let n = core::cmp::min(PGSIZE - page_off, remaining.len());

            let mut pte = self.pagetable.pte_at(page_base).ok_or(KernError::BadAddress)?;
            if pte.flags().contains(PteFlags::C) {
                self.resolve_cow(page_base)?;
                pte = self.pagetable.pte_at(page_base).expect("resolve_cow installed a leaf");
            }
            let pa = pte.pa();
            unsafe {
                core::ptr::copy_nonoverlapping(remaining.as_ptr(), (pa + page_off) as *mut u8, n);
            }
            if let Some(idx) = crate::vma::containing(self, page_base) {
                if self.vmas[idx].as_ref().expect("containing returned a live slot").shared() {
                    self.pagetable.set_pte(page_base, pa, pte.flags() | PteFlags::D);
                }
            }
            remaining = &remaining[n..];
            va += n;
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes out of user memory starting at `srcva`.
    ///
    /// Addresses entirely below `PLIC` go through the fast path: a
    /// direct walk of the per-process kernel shadow table (no fault
    /// repair — the shadow mirrors whatever the user table already
    /// has). Addresses at or above `PLIC` use the slow, walk-based path
    /// that repairs a lazy or copy-on-write miss via
    /// `page_fault_handler`, same shape as `copyout`. A range straddling
    /// `PLIC` is split: the prefix below goes through the fast path,
    /// the remainder through the slow one.
    pub fn copyin(&mut self, dst: &mut [u8], srcva: usize) -> KernResult<()> {
        if srcva < riscv::PLIC {
            let split = core::cmp::min(dst.len(), riscv::PLIC - srcva);
            let (head, tail) = dst.split_at_mut(split);
            self.copyin_fast(head, srcva)?;
            if !tail.is_empty() {
                self.copyin_slow(tail, srcva + split)?;
            }
            Ok(())
        } else {
            self.copyin_slow(dst, srcva)
        }
    }

    /// The below-`PLIC` fast path: resolves each page through the
    /// installed kernel shadow (falling back to the user table itself
    /// when no shadow is attached, e.g. in tests that never install
    /// one) and copies directly, with no fault repair.
    fn copyin_fast(&self, dst: &mut [u8], srcva: usize) -> KernResult<()> {
        let mut remaining = dst;
        let mut va = srcva;
        while !remaining.is_empty() {
            let page_off = va % PGSIZE;
            let n = core::cmp::min(PGSIZE - page_off, remaining.len());
            let pa = match &self.kernel_pagetable {
                Some(kpt) => kpt.shadow_pagetable().walkaddr_any(va),
                None => self.pagetable.walkaddr(va),
            }
            .ok_or(KernError::BadAddress)?;
            unsafe {
                core::ptr::copy_nonoverlapping(pa as *const u8, remaining.as_mut_ptr(), n);
            }
            let (_, rest) = remaining.split_at_mut(n);
            remaining = rest;
            va += n;
        }
        Ok(())
    }

    /// The at-or-above-`PLIC` slow path: walks the user table directly,
    /// repairing a miss via `page_fault_handler` before retrying once.
    fn copyin_slow(&mut self, dst: &mut [u8], srcva: usize) -> KernResult<()> {
        let mut remaining = dst;
        let mut va = srcva;
        while !remaining.is_empty() {
            let page_base = riscv::pgrounddown(va);
            let page_off = va - page_base;
            let n = core::cmp::min(PGSIZE - page_off, remaining.len());
            let pa = match self.pagetable.walkaddr(va) {
                Some(pa) => pa,
                None => {
                    self.page_fault_handler(page_base)?;
                    self.pagetable.walkaddr(va).ok_or(KernError::BadAddress)?
                }
            };
            unsafe {
                core::ptr::copy_nonoverlapping(pa as *const u8, remaining.as_mut_ptr(), n);
            }
            let (_, rest) = remaining.split_at_mut(n);
            remaining = rest;
            va += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string out of user memory, stopping at
    /// the first NUL or when `dst` is exhausted. Returns the string's
    /// length, not counting the NUL. Subject to the same `PLIC`
    /// fast/slow split as `copyin`.
    pub fn copyinstr(&mut self, dst: &mut [u8], srcva: usize) -> KernResult<usize> {
        let mut va = srcva;
        let mut written = 0usize;
        while written < dst.len() {
            let page_base = riscv::pgrounddown(va);
            let page_off = va - page_base;
            let n = core::cmp::min(PGSIZE - page_off, dst.len() - written);

            let fast = va < riscv::PLIC;
            let pa = if fast {
                match &self.kernel_pagetable {
                    Some(kpt) => kpt.shadow_pagetable().walkaddr_any(va),
                    None => self.pagetable.walkaddr(va),
                }
                .ok_or(KernError::BadAddress)?
            } else {
                match self.pagetable.walkaddr(va) {
                    Some(pa) => pa,
                    None => {
                        self.page_fault_handler(page_base)?;
                        self.pagetable.walkaddr(va).ok_or(KernError::BadAddress)?
                    }
                }
            };

            let chunk = unsafe { core::slice::from_raw_parts(pa as *const u8, n) };
            if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                dst[written..written + pos].copy_from_slice(&chunk[..pos]);
                return Ok(written + pos);
            }
            dst[written..written + n].copy_from_slice(chunk);
            written += n;
            va += n;
        }
        Err(KernError::BadAddress)
    }

    /// Services a page fault at `va`: repairs a copy-on-write page,
    /// lazily backs a claimed-but-not-yet-mapped heap page, or
    /// demand-pages an `mmap` region — whichever applies — and fails
    /// for every other address, including the guard page one page
    /// below the user stack.
    pub fn page_fault_handler(&mut self, va: usize) -> KernResult<()> {
        let va = riscv::pgrounddown(va);

        if let Some(pte) = self.pagetable.pte_at(va) {
            if pte.is_valid() && pte.flags().contains(PteFlags::C) {
                return self.resolve_cow(va);
            }
        }

        let lazy_valid = va < self.sz;
        let mmap_index = crate::vma::containing(self, va);
        let not_stack = va != self.ustack.wrapping_sub(PGSIZE);

        if (lazy_valid || mmap_index.is_some()) && not_stack {
            self.map_one_page(va)?;
            if lazy_valid {
                if let Some(shadow) = self.kernel_pagetable.as_mut() {
                    shadow.sync_user_mapping(va, va + PGSIZE, self.sz, self.vma_bound, &self.pagetable);
                }
            } else if let Some(idx) = mmap_index {
                crate::vma::load_vma(self, idx, va)?;
            }
            return Ok(());
        }

        Err(KernError::BadAddress)
    }

    /// Tears down the whole address space: every `mmap` region is
    /// unmapped (writing back any dirty `MAP_SHARED` pages through
    /// `journal`), every page below `sz` is freed, the kernel shadow
    /// (if any) is torn down, and finally the page table itself.
    pub fn teardown(mut self, journal: &dyn crate::proc::Journal) {
        crate::vma::unmap_all(&mut self, journal);
        let npages = riscv::pgroundup(self.sz) / PGSIZE;
        if npages > 0 {
            self.pagetable.unmap(0, npages, true);
        }
        if let Some(kpt) = self.kernel_pagetable.take() {
            kpt.teardown();
        }
        self.pagetable.free();
    }
}
