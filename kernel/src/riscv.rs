//! Sv39 layout constants and the handful of machine primitives the core
//! needs: page rounding, the PTE encoding, and the per-CPU preemption
//! counter that guards the allocator's freelist lookup.

use crate::param;
use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PGSIZE: usize = 4096;
const PGSHIFT: usize = 12;
const_assert_eq!(1usize << PGSHIFT, PGSIZE);

pub const fn pgroundup(a: usize) -> usize {
    (a + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// One level-0/1/2 index is 9 bits; there are three levels plus a
/// 12-bit page offset, giving Sv39 a 38-bit (signed, so really 39-bit)
/// virtual address space.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + PGSHIFT - 1);

pub const TRAMPOLINE: usize = MAXVA - PGSIZE;
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// The user stack sits just below the trapframe, one guard page down
/// so a stack overflow faults instead of silently corrupting the
/// trapframe. `USEREND` is the exclusive top of user-reachable
/// virtual memory, used to bound lazy-growth and `mmap` placement.
pub const USTACK_GUARD: usize = TRAPFRAME - PGSIZE;
pub const USERSTACK: usize = USTACK_GUARD - PGSIZE;
pub const USEREND: usize = USTACK_GUARD;

/// MMIO regions mirrored into every per-process kernel page table.
pub const UART0: usize = 0x1000_0000;
pub const VIRTIO0: usize = 0x1000_1000;
pub const CLINT: usize = 0x0200_0000;
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_MAP_SIZE: usize = 0x0040_0000;

/// Kernel stack `i`, with a guard page below each one (KSTACK(i) in the
/// original: stacks grow down from TRAMPOLINE, one guard page apart).
pub const fn kstack(i: usize) -> usize {
    TRAMPOLINE - (i + 1) * 2 * PGSIZE
}

pub fn px(level: usize, va: usize) -> usize {
    debug_assert!(level < 3);
    (va >> (PGSHIFT + 9 * level)) & 0x1ff
}

bitflags! {
    /// Sv39 PTE flag bits. `V/R/W/X/U` are the hardware-defined bits;
    /// `C` and `D` occupy the two RSW (reserved-for-software) bits and
    /// carry no hardware meaning: `C` marks a copy-on-write shared
    /// frame, `D` marks a page `copyout` has dirtied.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const C = 1 << 8;
        const D = 1 << 9;
    }
}

impl PteFlags {
    pub const RWX: PteFlags = PteFlags::R.union(PteFlags::W).union(PteFlags::X);

    pub fn is_leaf(self) -> bool {
        self.intersects(PteFlags::RWX)
    }
}

const FLAGS_MASK: u64 = 0x3ff;
const PPN_SHIFT: u64 = 10;

/// A single 64-bit page-table entry. Derives zerocopy's traits so a
/// `Page` can be safely reinterpreted as `[Pte; 512]` (see
/// `pagetable::as_entries`) instead of the raw pointer casts the
/// original's C `pte_t*` arithmetic relied on.
#[derive(Clone, Copy, Eq, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct Pte(u64);
const_assert_eq!(core::mem::size_of::<Pte>(), 8);

impl Pte {
    pub const fn zero() -> Pte {
        Pte(0)
    }

    pub fn new(pa: usize, flags: PteFlags) -> Pte {
        Pte(pa2pte(pa) | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn pa(self) -> usize {
        pte2pa(self.0)
    }

    pub fn set(&mut self, pa: usize, flags: PteFlags) {
        self.0 = pa2pte(pa) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn with_flags(self, flags: PteFlags) -> Pte {
        Pte(pa2pte(self.pa()) | flags.bits())
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pte(pa={:#x}, flags={:?})", self.pa(), self.flags())
    }
}

pub fn pa2pte(pa: usize) -> u64 {
    (pa as u64 >> PGSHIFT) << PPN_SHIFT
}

pub fn pte2pa(pte: u64) -> usize {
    ((pte >> PPN_SHIFT) << PGSHIFT) as usize
}

/// `COW_FLAGS`: the flags installed on both parent and child leaves when
/// `copy()` converts a page to copy-on-write — W is cleared, C is set,
/// everything else (including the stashed-away write permission) is
/// left alone so `COW_WFLAGS` can restore it later.
pub fn cow_flags(flags: PteFlags) -> PteFlags {
    (flags & !PteFlags::W) | PteFlags::C
}

/// `COW_WFLAGS`: the flags reinstated on the freshly copied frame when
/// a copy-on-write fault is serviced. Restores W, drops C.
pub fn cow_wflags(flags: PteFlags) -> PteFlags {
    (flags | PteFlags::W) & !PteFlags::C
}

/// Per-CPU nested preemption-disable counter, guarding the window in
/// which `kalloc`/`kfree` identify the current CPU and touch its
/// freelist. A real port wires this to interrupt enable/disable; the
/// test/host build just counts nesting depth per thread.
pub struct Cpu {
    noff: core::cell::Cell<u32>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Cpu {
        Cpu {
            noff: core::cell::Cell::new(0),
        }
    }
}

#[cfg(not(test))]
static CPUS: [Cpu; param::NCPU] = {
    const INIT: Cpu = Cpu::new();
    [INIT; param::NCPU]
};

#[cfg(test)]
std::thread_local! {
    static TEST_NOFF: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
}

/// Returns this hart's id. Outside of tests there is exactly one
/// current hart per physical core and the real kernel supplies this
/// via `tp`; under test we hash the host thread id so concurrent test
/// threads fan out across the simulated `NCPU` freelists the same way
/// real harts would.
pub fn cpuid() -> usize {
    #[cfg(test)]
    {
        use std::hash::{Hash, Hasher};
        let id = std::thread::current().id();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % param::NCPU
    }
    #[cfg(not(test))]
    {
        0
    }
}

/// The handful of genuine hardware operations this crate cannot carry
/// out itself: installing a page table and flushing the TLB are real
/// CSR writes (`satp`, `sfence.vma`) on actual silicon. The embedding
/// kernel implements this trait over real instructions, tests over a
/// no-op fake.
pub trait Hal: Sync {
    fn w_satp(&self, root_pa: usize);
    fn sfence_vma(&self);
}

pub fn push_off() {
    #[cfg(test)]
    TEST_NOFF.with(|c| c.set(c.get() + 1));
    #[cfg(not(test))]
    CPUS[cpuid()].noff.set(CPUS[cpuid()].noff.get() + 1);
}

pub fn pop_off() {
    #[cfg(test)]
    TEST_NOFF.with(|c| {
        let n = c.get();
        assert!(n > 0, "pop_off: not holding");
        c.set(n - 1);
    });
    #[cfg(not(test))]
    {
        let n = CPUS[cpuid()].noff.get();
        assert!(n > 0, "pop_off: not holding");
        CPUS[cpuid()].noff.set(n - 1);
    }
}
