//! Memory-mapped file regions: a per-process, fixed-capacity table of
//! `mmap`-style windows growing downward from `TRAMPOLINE`'s neighbor,
//! demand-loaded on first touch and written back to their backing file
//! on unmap.
//!
//! The table is kept sorted descending by `vm_start` with valid
//! entries packed to a prefix, an invariant maintained by swapping
//! adjacent slots rather than a general sort.

use crate::file::FileHandle;
use crate::param::NVMA;
use crate::proc::Journal;
use crate::riscv::{self, PteFlags, PGSIZE};
use crate::uvm::AddressSpace;
use crate::{KernError, KernResult};
use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// One `mmap`ed region. `file` is a dup'd handle this region owns for
/// as long as it's mapped; `unmap_vma` closes it when the region
/// shrinks to nothing.
pub struct Vma {
    vm_start: usize,
    vm_end: usize,
    prot: Prot,
    shared: bool,
    file: &'static FileHandle,
    offset: usize,
}

impl Vma {
    pub fn vm_start(&self) -> usize {
        self.vm_start
    }

    pub fn vm_end(&self) -> usize {
        self.vm_end
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    fn contains(&self, va: usize) -> bool {
        va >= self.vm_start && va < self.vm_end
    }

    fn overlaps(&self, begin: usize, end: usize) -> bool {
        begin < self.vm_end && self.vm_start < end
    }
}

/// Valid entries are packed into `[0, n)`; `n` is the first `None`.
fn valid_count(asp: &AddressSpace) -> usize {
    asp.vmas.iter().position(|v| v.is_none()).unwrap_or(NVMA)
}

/// Recomputes `vma_bound` as the smallest valid `vm_start`, or
/// `TRAPFRAME` when the table is empty — descending sort order means
/// that's always the last packed entry.
fn recompute_bound(asp: &mut AddressSpace) {
    let n = valid_count(asp);
    asp.vma_bound = if n == 0 { riscv::TRAPFRAME } else { asp.vmas[n - 1].as_ref().unwrap().vm_start };
}

/// Which VMA, if any, owns `va`. Addresses outside
/// `[vma_bound, TRAPFRAME)` are never in any region, a fast reject
/// applied before scanning the table.
pub fn containing(asp: &AddressSpace, va: usize) -> Option<usize> {
    if va < asp.vma_bound || va >= riscv::TRAPFRAME {
        return None;
    }
    let n = valid_count(asp);
    asp.vmas[..n].iter().position(|v| v.as_ref().is_some_and(|v| v.contains(va)))
}

/// Opens a new mapping `[begin, end)` backed by `file` starting at
/// `offset`. Rejects an empty or inverted range, any overlap with an
/// existing region, and a full table. On success, inserts the new
/// entry and bubbles it toward index 0 until the descending-by-
/// `vm_start` order is restored, then recomputes `vma_bound`.
pub fn map_vma(
    asp: &mut AddressSpace,
    begin: usize,
    end: usize,
    prot: Prot,
    shared: bool,
    file: &'static FileHandle,
    offset: usize,
) -> KernResult<usize> {
    if begin >= end {
        return Err(KernError::BadUnmapRange);
    }
    let n = valid_count(asp);
    if asp.vmas[..n].iter().flatten().any(|v| v.overlaps(begin, end)) {
        return Err(KernError::VmaOverlap);
    }
    if n == NVMA {
        return Err(KernError::VmaFull);
    }

    let mut i = n;
    asp.vmas[i] = Some(Vma { vm_start: begin, vm_end: end, prot, shared, file: file.dup(), offset });
    while i > 0 && asp.vmas[i].as_ref().unwrap().vm_start > asp.vmas[i - 1].as_ref().unwrap().vm_start {
        asp.vmas.swap(i, i - 1);
        i -= 1;
    }
    recompute_bound(asp);
    Ok(i)
}

/// Services a fault inside VMA `index` at `va`: reads the page in from
/// the backing file at the matching file offset, then rewrites the
/// leaf's permission bits to exactly the region's `prot`, discarding
/// the temporary write permission `uvmalloc` installed to allocate the
/// frame in the first place.
pub fn load_vma(asp: &mut AddressSpace, index: usize, va: usize) -> KernResult<()> {
    let (vm_start, vm_end, prot, offset_base, file) = {
        let vma = asp.vmas[index].as_ref().ok_or(KernError::BadAddress)?;
        (vma.vm_start, vma.vm_end, vma.prot, vma.offset, vma.file)
    };
    let offset = va - vm_start + offset_base;
    let len = core::cmp::min(PGSIZE, vm_end - va);

    let pte = asp.pagetable().pte_at(va).filter(|p| p.is_valid()).ok_or(KernError::BadAddress)?;
    let pa = pte.pa();
    let dst = unsafe { core::slice::from_raw_parts_mut(pa as *mut u8, len) };

    let inode = file.ops().inode();
    inode.lock();
    let read = inode.readi(dst, offset);
    inode.unlock();
    let read = read?;
    if read == 0 && len != 0 {
        return Err(KernError::Io);
    }

    let mut flags = PteFlags::V | PteFlags::U;
    if prot.contains(Prot::READ) {
        flags |= PteFlags::R;
    }
    if prot.contains(Prot::WRITE) {
        flags |= PteFlags::W;
    }
    if prot.contains(Prot::EXEC) {
        flags |= PteFlags::X;
    }
    asp.pagetable_mut().set_pte(va, pa, flags);
    Ok(())
}

/// Duplicates every valid entry of `src`'s VMA table into `dst`
/// (dup'ing each backing file handle), then eagerly shares the VMA
/// range `[vma_bound, TRAPFRAME)` copy-on-write between the two
/// address spaces, the same path anonymous pages take.
pub fn copy_vma(src: &mut AddressSpace, dst: &mut AddressSpace) -> KernResult<()> {
    let n = valid_count(src);
    for i in 0..n {
        let v = src.vmas[i].as_ref().unwrap();
        dst.vmas[i] = Some(Vma {
            vm_start: v.vm_start,
            vm_end: v.vm_end,
            prot: v.prot,
            shared: v.shared,
            file: v.file.dup(),
            offset: v.offset,
        });
    }
    dst.vma_bound = src.vma_bound;
    let bound = src.vma_bound;
    src.copy_range(dst, bound, riscv::TRAPFRAME)
}

/// Shrinks or removes VMA `index`'s `[begin, end)` sub-range. Per
/// spec, `[begin, end)` must touch one endpoint of the region (partial
/// interior holes aren't supported): either `begin == vm_start` or
/// `end == vm_end`.
///
/// Every page in `[begin, end)` that's present and dirty in a
/// `MAP_SHARED` region is written back to the file first, bracketed by
/// `journal`'s transaction and the inode's own lock. Pages that end up
/// outside the shrunken region are then unmapped; pages the shrunken
/// region still covers are left alone. When the region shrinks to
/// nothing, its file handle is closed, the slot is freed, and every
/// later valid entry is swapped down to keep the table's prefix
/// packed.
pub fn unmap_vma(asp: &mut AddressSpace, journal: &dyn Journal, index: usize, begin: usize, end: usize) -> KernResult<()> {
    let (vm_start, vm_end, shared, base_offset, file) = {
        let vma = asp.vmas[index].as_ref().ok_or(KernError::BadUnmapRange)?;
        (vma.vm_start, vma.vm_end, vma.shared, vma.offset, vma.file)
    };
    if vm_start > begin || vm_end < end || end < begin {
        return Err(KernError::BadUnmapRange);
    }
    if vm_start != begin && vm_end != end {
        return Err(KernError::BadUnmapRange);
    }

    let new_start = if vm_start == begin { end } else { vm_start };
    let new_end = if vm_start == begin { vm_end } else { begin };

    let mut va = riscv::pgrounddown(begin);
    let mut offset = begin - vm_start + base_offset;
    while va < end {
        let pagebound = core::cmp::min(riscv::pgroundup(va + 1), end);
        let writelen = pagebound - va;

        if let Some(pte) = asp.pagetable().pte_at(va).filter(|p| p.is_valid()) {
            if shared && pte.flags().contains(PteFlags::D) {
                let inode = file.ops().inode();
                journal.begin_op();
                inode.lock();
                let wrote = inode.writei(unsafe { core::slice::from_raw_parts(pte.pa() as *const u8, writelen) }, offset);
                inode.unlock();
                journal.end_op();
                wrote?;
            }
            if va < riscv::pgrounddown(new_start) || va >= riscv::pgroundup(new_end) {
                asp.pagetable_mut().unmap(va, 1, true);
            }
        }

        va += writelen;
        offset += writelen;
    }

    {
        let vma = asp.vmas[index].as_mut().expect("unmap_vma: vma vanished mid-unmap");
        vma.vm_start = new_start;
        vma.vm_end = new_end;
    }

    if new_start == new_end {
        if new_start > riscv::pgrounddown(new_start) {
            asp.pagetable_mut().unmap(riscv::pgrounddown(new_start), 1, true);
        }
        let vma = asp.vmas[index].take().expect("unmap_vma: emptied vma still present");
        vma.file.close();
        let mut i = index;
        while i + 1 < NVMA && asp.vmas[i + 1].is_some() {
            asp.vmas.swap(i, i + 1);
            i += 1;
        }
    }

    recompute_bound(asp);
    Ok(())
}

/// Tears down every mapped region, writing back any dirty
/// `MAP_SHARED` pages along the way.
pub fn unmap_all(asp: &mut AddressSpace, journal: &dyn Journal) {
    while let Some(index) = asp.vmas.iter().position(|v| v.is_some()) {
        let (begin, end) = {
            let vma = asp.vmas[index].as_ref().unwrap();
            (vma.vm_start, vma.vm_end)
        };
        unmap_vma(asp, journal, index, begin, end).expect("unmap_all: whole-region unmap cannot fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::fake::FakeFile;
    use crate::kalloc::test_support;
    use crate::riscv::PteFlags;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn arena() {
        INIT.call_once(|| {
            test_support::ensure_initialized();
        });
    }

    struct NullJournal;
    impl Journal for NullJournal {
        fn begin_op(&self) {}
        fn end_op(&self) {}
    }
    static JOURNAL: NullJournal = NullJournal;

    fn leak_file(contents: Vec<u8>) -> &'static FileHandle {
        let file: &'static FakeFile = Box::leak(Box::new(FakeFile::new(contents)));
        Box::leak(Box::new(FileHandle::new(file)))
    }

    #[test]
    fn map_then_fault_loads_file_contents() {
        arena();
        let mut asp = AddressSpace::new().unwrap();
        asp.uvminit(&[0]).unwrap();
        let file = leak_file(b"hello, vma".to_vec());

        let idx = map_vma(&mut asp, riscv::TRAPFRAME - PGSIZE, riscv::TRAPFRAME, Prot::READ | Prot::WRITE, false, file, 0).unwrap();
        assert_eq!(asp.vma_bound, riscv::TRAPFRAME - PGSIZE);

        let va = riscv::TRAPFRAME - PGSIZE;
        asp.page_fault_handler(va).expect("mmap fault services");
        assert_eq!(containing(&asp, va), Some(idx));

        let pte = asp.pagetable().pte_at(va).unwrap();
        assert!(!pte.flags().contains(PteFlags::C), "load_vma must discard the temporary cow bit");
        let mut buf = [0u8; 10];
        asp.copyin(&mut buf, va).unwrap();
        assert_eq!(&buf, b"hello, vma");
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        arena();
        let mut asp = AddressSpace::new().unwrap();
        asp.uvminit(&[0]).unwrap();
        let file = leak_file(vec![0u8; PGSIZE * 2]);

        map_vma(&mut asp, riscv::TRAPFRAME - 2 * PGSIZE, riscv::TRAPFRAME, Prot::READ, false, file, 0).unwrap();
        let err = map_vma(&mut asp, riscv::TRAPFRAME - PGSIZE, riscv::TRAPFRAME, Prot::READ, false, file, 0).unwrap_err();
        assert_eq!(err, KernError::VmaOverlap);
    }

    #[test]
    fn shared_writeback_on_unmap_updates_file() {
        arena();
        let mut asp = AddressSpace::new().unwrap();
        asp.uvminit(&[0]).unwrap();
        let file = leak_file(vec![0u8; 2 * PGSIZE]);

        let idx = map_vma(&mut asp, riscv::TRAPFRAME - 2 * PGSIZE, riscv::TRAPFRAME, Prot::READ | Prot::WRITE, true, file, 0).unwrap();
        let page0 = riscv::TRAPFRAME - 2 * PGSIZE;
        let page1 = riscv::TRAPFRAME - PGSIZE;
        asp.page_fault_handler(page0).unwrap();
        asp.page_fault_handler(page1).unwrap();

        asp.copyout(page1, b"world").unwrap();

        unmap_vma(&mut asp, &JOURNAL, idx, page0, riscv::TRAPFRAME).unwrap();
        assert_eq!(asp.vma_bound, riscv::TRAPFRAME);

        let ops = file.ops();
        let inode = ops.inode();
        let mut buf = [0u8; 2 * PGSIZE];
        inode.readi(&mut buf, 0).unwrap();
        assert!(buf[..PGSIZE].iter().all(|&b| b == 0), "page 0 was never written, must be unchanged");
        assert_eq!(&buf[PGSIZE..PGSIZE + 5], b"world", "page 1's write must land at its own file offset");
    }

    #[test]
    fn unmap_all_closes_every_region() {
        arena();
        let mut asp = AddressSpace::new().unwrap();
        asp.uvminit(&[0]).unwrap();
        let a = leak_file(vec![0u8; PGSIZE]);
        let b = leak_file(vec![0u8; PGSIZE]);
        map_vma(&mut asp, riscv::TRAPFRAME - 2 * PGSIZE, riscv::TRAPFRAME - PGSIZE, Prot::READ, false, a, 0).unwrap();
        map_vma(&mut asp, riscv::TRAPFRAME - PGSIZE, riscv::TRAPFRAME, Prot::READ, false, b, 0).unwrap();

        unmap_all(&mut asp, &JOURNAL);
        assert_eq!(asp.vma_bound, riscv::TRAPFRAME);
        assert!(asp.vmas.iter().all(|v| v.is_none()));
    }
}
