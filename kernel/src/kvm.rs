//! The per-process kernel page table: a shadow of the global kernel's
//! fixed mappings (MMIO, kernel text/data, the trampoline) plus this
//! process's own kernel stack, installed in `satp` whenever the
//! process is running. Letting syscalls dereference a user pointer by
//! mirroring the same leaf into this table (with `U` cleared so it's
//! still only reachable from supervisor mode) avoids walking the user
//! page table by hand on every `copyin`/`copyout`.

use crate::kalloc::{self, Page};
use crate::pagetable::PageTable;
use crate::riscv::{self, Hal, PteFlags, PGSIZE};
use crate::{KernError, KernResult};

/// The three boundaries only the embedding kernel's own link layout
/// can supply: where its text/data end and where the trampoline page
/// actually lives in physical memory. Every other region this module
/// mirrors (UART, virtio, PLIC) is a fixed MMIO address already known
/// to `riscv`.
#[derive(Clone, Copy)]
pub struct KernelLayout {
    pub text_start: usize,
    pub text_end: usize,
    pub data_end: usize,
    pub trampoline_pa: usize,
}

/// A process's private mirror of the kernel's address space. Every
/// mapping here is identity (`va == pa`) except the trampoline and the
/// kernel stack, matching `proc_kvminit`.
pub struct ProcKernelPageTable {
    pagetable: PageTable,
    layout: KernelLayout,
    kstack: usize,
}

impl ProcKernelPageTable {
    /// Builds a fresh shadow table and gives it one kernel-stack page
    /// at `kstack_slot`. Unlike the global kernel page table, a
    /// per-process one never maps CLINT — that stays wired into
    /// `kernel_pagetable` itself.
    pub fn new(layout: KernelLayout, kstack_slot: usize) -> KernResult<ProcKernelPageTable> {
        let mut pagetable = PageTable::new()?;
        pagetable.mappages(riscv::UART0, riscv::UART0, PGSIZE, PteFlags::R | PteFlags::W)?;
        pagetable.mappages(riscv::VIRTIO0, riscv::VIRTIO0, PGSIZE, PteFlags::R | PteFlags::W)?;
        pagetable.mappages(riscv::PLIC, riscv::PLIC, riscv::PLIC_MAP_SIZE, PteFlags::R | PteFlags::W)?;
        pagetable.mappages(layout.text_start, layout.text_start, layout.text_end - layout.text_start, PteFlags::R | PteFlags::X)?;
        pagetable.mappages(layout.text_end, layout.text_end, layout.data_end - layout.text_end, PteFlags::R | PteFlags::W)?;
        pagetable.mappages(riscv::TRAMPOLINE, layout.trampoline_pa, PGSIZE, PteFlags::R | PteFlags::X)?;

        let stack_page = kalloc::kalloc().ok_or(KernError::OutOfMemory)?;
        let stack_pa = stack_page as *mut Page as usize;
        if let Err(e) = pagetable.mappages(kstack_slot, stack_pa, PGSIZE, PteFlags::R | PteFlags::W) {
            kalloc::kfree(unsafe { &mut *(stack_pa as *mut Page) });
            return Err(e);
        }

        Ok(ProcKernelPageTable { pagetable, layout, kstack: kstack_slot })
    }

    pub fn kstack(&self) -> usize {
        self.kstack
    }

    #[cfg(test)]
    pub(crate) fn pagetable_for_test(&self) -> &PageTable {
        &self.pagetable
    }

    /// The shadow table itself, for `uvm::AddressSpace::copyin`'s fast
    /// path: addresses below `PLIC` are resolved directly through this
    /// table (which mirrors the user mapping U-cleared) instead of
    /// walking the user page table or faulting through the hart's
    /// actually-installed `satp`.
    pub fn shadow_pagetable(&self) -> &PageTable {
        &self.pagetable
    }

    /// Installs this table as the hart's active page table and
    /// flushes stale translations.
    pub fn install(&self, hal: &dyn Hal) {
        hal.w_satp(self.pagetable.root_pa());
        hal.sfence_vma();
    }

    /// Translates a kernel virtual address mapped by this shadow table
    /// to its physical address — the counterpart of the original's
    /// `kvmpa`/`proc_kvmpa`, only ever needed for addresses on this
    /// process's own kernel stack.
    ///
    /// # Panics
    /// If `va` isn't mapped by this table.
    pub fn kvmpa(&self, va: usize) -> usize {
        self.pagetable.walkaddr_any(va).expect("kvmpa: unmapped kernel address")
    }

    /// Keeps the shadow of low user memory in sync with heap growth
    /// and shrinkage. Addresses at or past `vma_bound` (the `mmap`
    /// region, which this shadow never covers) or past `PLIC` are
    /// clamped rather than mirrored.
    ///
    /// # Panics
    /// If `newsz` exceeds the process's rounded-up size.
    pub fn sync_user_mapping(&mut self, oldsz: usize, newsz: usize, sz: usize, vma_bound: usize, user: &PageTable) {
        assert!(newsz <= riscv::pgroundup(sz), "sync_user_mapping: newsz beyond process size");
        if newsz >= vma_bound || oldsz >= vma_bound {
            crate::kwarn!("sync_user_mapping: range touches the vma region, skipping");
            return;
        }
        let oldsz = core::cmp::min(oldsz, riscv::PLIC);
        let newsz = core::cmp::min(newsz, riscv::PLIC);
        if oldsz > newsz {
            let lo = riscv::pgroundup(newsz);
            let hi = riscv::pgroundup(oldsz);
            if hi > lo {
                self.pagetable.unmap(lo, (hi - lo) / PGSIZE, false);
            }
        } else {
            let mut va = riscv::pgroundup(oldsz);
            let end = riscv::pgroundup(newsz);
            while va < end {
                if let Some(pte) = user.pte_at(va) {
                    if pte.is_valid() {
                        let flags = pte.flags() - PteFlags::U;
                        self.pagetable.mappages(va, pte.pa(), PGSIZE, flags).expect("sync_user_mapping: mappages");
                    }
                }
                va += PGSIZE;
            }
        }
    }

    /// `proc_freekpagetable`: unmaps every mirrored region (without
    /// freeing the frames behind them — this table only ever shadows
    /// memory some other owner is responsible for) and this process's
    /// own kernel stack (which it *does* own), then frees the table.
    pub fn teardown(self) {
        let ProcKernelPageTable { mut pagetable, layout, kstack } = self;
        pagetable.unmap(riscv::UART0, 1, false);
        pagetable.unmap(riscv::VIRTIO0, 1, false);
        pagetable.unmap(riscv::PLIC, riscv::pgroundup(riscv::PLIC_MAP_SIZE) / PGSIZE, false);
        pagetable.unmap(layout.text_start, riscv::pgroundup(layout.text_end - layout.text_start) / PGSIZE, false);
        pagetable.unmap(layout.text_end, riscv::pgroundup(layout.data_end - layout.text_end) / PGSIZE, false);
        pagetable.unmap(riscv::TRAMPOLINE, 1, false);
        pagetable.unmap(kstack, 1, true);
        pagetable.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHal;
    impl Hal for NoopHal {
        fn w_satp(&self, _root_pa: usize) {}
        fn sfence_vma(&self) {}
    }

    fn tiny_layout() -> KernelLayout {
        KernelLayout { text_start: 0x8000_0000, text_end: 0x8000_1000, data_end: 0x8000_2000, trampoline_pa: 0x8000_3000 }
    }

    #[test]
    fn build_install_and_teardown() {
        crate::kalloc::test_support::ensure_initialized();
        let kpt = ProcKernelPageTable::new(tiny_layout(), riscv::kstack(0)).unwrap();
        assert_eq!(kpt.kstack(), riscv::kstack(0));
        kpt.install(&NoopHal);
        kpt.teardown();
    }

    #[test]
    fn kvmpa_translates_the_kernel_stack_mapping() {
        crate::kalloc::test_support::ensure_initialized();
        let kpt = ProcKernelPageTable::new(tiny_layout(), riscv::kstack(2)).unwrap();
        let pa = kpt.kvmpa(kpt.kstack() + 0x10);
        let stack_base = kpt.pagetable.walkaddr_any(kpt.kstack()).unwrap();
        assert_eq!(pa, stack_base + 0x10);
        kpt.teardown();
    }

    #[test]
    #[should_panic(expected = "kvmpa: unmapped kernel address")]
    fn kvmpa_panics_on_an_unmapped_address() {
        crate::kalloc::test_support::ensure_initialized();
        let kpt = ProcKernelPageTable::new(tiny_layout(), riscv::kstack(3)).unwrap();
        kpt.kvmpa(0x4000);
    }

    #[test]
    fn sync_user_mapping_mirrors_growth_and_shrink() {
        crate::kalloc::test_support::ensure_initialized();
        let mut kpt = ProcKernelPageTable::new(tiny_layout(), riscv::kstack(1)).unwrap();

        let mut user = PageTable::new().unwrap();
        let frame = kalloc::kalloc().unwrap();
        let pa = frame as *mut Page as usize;
        user.mappages(0, pa, PGSIZE, PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

        kpt.sync_user_mapping(0, PGSIZE, PGSIZE, riscv::TRAPFRAME, &user);
        let mirrored = kpt.pagetable.pte_at(0).expect("growth mirrors the leaf");
        assert!(!mirrored.flags().contains(PteFlags::U), "shadow mapping must not be user-accessible");
        assert_eq!(mirrored.pa(), pa);

        kpt.sync_user_mapping(PGSIZE, 0, 0, riscv::TRAPFRAME, &user);
        assert!(kpt.pagetable.pte_at(0).is_none(), "shrink must unmap the shadow leaf");

        user.unmap(0, 1, true);
        user.free();
        kpt.teardown();
    }
}
