//! The physical page allocator: one free list per simulated CPU, plus
//! a reference-count table so copy-on-write pages can be shared
//! safely. Uses an intrusive free list (a page's own bytes double as
//! the list node once freed — see `FreeNode`), generalized from a
//! single global list to one list per `NCPU` shard, with work-stealing
//! when a CPU's own list runs dry.
//!
//! This crate never assumes a physical memory layout: the embedding
//! kernel hands `kinit` the exact usable range, which could just as
//! well be a test's heap-backed arena as a real machine's RAM.
//!
//! `kalloc` does not zero the page it hands back — it fills it with a
//! junk sentinel instead, the same debug aid the original allocator
//! uses, so a caller that forgets to initialize its own content reads
//! obvious garbage rather than silent zeros. Callers that need a
//! zeroed frame (a fresh page-table node, a lazily-allocated anonymous
//! page) zero it themselves, exactly as `uvmcreate`/`walk`/`uvmalloc`
//! do in the original.

use crate::param::{self, NCPU};
use crate::riscv::{self, PGSIZE};
use crate::spinlock::SpinMutex as Mutex;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// One physical page frame. The allocator never interprets the
/// contents; callers get a page-aligned buffer back from `kalloc`
/// (filled with debug junk, not zeroed) and must return it, and only
/// it, to `kfree`.
#[repr(align(4096))]
pub struct Page(pub [u8; PGSIZE]);

impl Page {
    /// `kfree`'s junk fill: overwrite a page before it goes onto a free
    /// list, so a dangling reference reads obvious garbage instead of a
    /// live page's last contents.
    fn fill_free_junk(&mut self) {
        self.0.fill(1);
    }

    /// `kalloc`'s junk fill: a freshly handed-out page reads as this
    /// sentinel, not zero, until its new owner initializes it.
    fn fill_alloc_junk(&mut self) {
        self.0.fill(5);
    }
}

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct FreeList {
    head: Option<NonNull<FreeNode>>,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn empty() -> FreeList {
        FreeList { head: None }
    }

    fn put(&mut self, page: &'static mut Page) {
        page.fill_free_junk();
        let node = page as *mut Page as *mut FreeNode;
        unsafe {
            ptr::write(node, FreeNode { next: self.head });
        }
        self.head = NonNull::new(node);
    }

    fn get(&mut self) -> Option<&'static mut Page> {
        let mut head = self.head?;
        let node = unsafe { head.as_mut() };
        self.head = node.next;
        let page = unsafe { &mut *(head.as_ptr() as *mut Page) };
        Some(page)
    }
}

static FREELISTS: [Mutex<FreeList>; NCPU] = [const { Mutex::new("kmem", FreeList::empty()) }; NCPU];

static REFCOUNTS: [AtomicU8; param::MAXPAGES] = [const { AtomicU8::new(0) }; param::MAXPAGES];

static BASE: AtomicUsize = AtomicUsize::new(0);
static LIMIT: AtomicUsize = AtomicUsize::new(0);

fn page_index(pa: usize) -> usize {
    (pa - BASE.load(Ordering::Relaxed)) / PGSIZE
}

/// Hands this allocator the `[first_usable, phystop)` range to manage.
/// Every frame in range starts with a refcount of one, exactly as the
/// original's `kinit`, so that `freerange`'s calls to `kfree` are what
/// actually drop each frame to zero and onto its shard's free list.
///
/// # Panics
/// If the range isn't page-aligned, is empty, or is too large for
/// `param::MAXPAGES` to track.
pub fn kinit(first_usable: usize, phystop: usize) {
    let first_usable = riscv::pgroundup(first_usable);
    assert_eq!(phystop % PGSIZE, 0, "kinit: phystop must be page-aligned");
    assert!(first_usable < phystop, "kinit: empty physical range");
    let npages = (phystop - first_usable) / PGSIZE;
    assert!(npages <= param::MAXPAGES, "kinit: physical range exceeds MAXPAGES");

    BASE.store(first_usable, Ordering::Relaxed);
    LIMIT.store(phystop, Ordering::Relaxed);
    for idx in 0..npages {
        REFCOUNTS[idx].store(1, Ordering::Relaxed);
    }
    freerange(first_usable, phystop);
}

fn freerange(start: usize, end: usize) {
    let mut pa = start;
    while pa + PGSIZE <= end {
        let page = unsafe { &mut *(pa as *mut Page) };
        kfree(page);
        pa += PGSIZE;
    }
}

/// Allocates one page, preferring the calling CPU's own free list and
/// falling back to stealing from another CPU's list if it's empty.
/// Returns `None` once every shard is dry. The returned page is filled
/// with debug junk, not zeroed — callers that need zeroed content
/// (a fresh page-table node, a lazily-mapped anonymous page) zero it
/// themselves.
pub fn kalloc() -> Option<&'static mut Page> {
    riscv::push_off();
    let id = riscv::cpuid();
    let page = kget(id).or_else(|| ksteal(id));
    if let Some(p) = page.as_ref() {
        let pa = (*p as *const Page).addr();
        REFCOUNTS[page_index(pa)].store(1, Ordering::Relaxed);
    }
    riscv::pop_off();
    page.map(|p| {
        p.fill_alloc_junk();
        p
    })
}

fn kget(id: usize) -> Option<&'static mut Page> {
    FREELISTS[id].with_lock(|fl| fl.get())
}

/// Round-robins through every other CPU's free list looking for a
/// spare page. On a single-CPU build this degenerates to an immediate
/// `None`.
fn ksteal(id: usize) -> Option<&'static mut Page> {
    for step in 1..NCPU {
        let victim = (id + step) % NCPU;
        if let Some(page) = kget(victim) {
            return Some(page);
        }
    }
    None
}

/// Drops `page`'s reference count by one, returning it to its owning
/// CPU's free list once the count reaches zero. Which shard owns a
/// page is a function of its own address, not of the calling CPU, so
/// frees always land back on the shard that frees the same way the
/// allocating CPU originally would have.
///
/// # Panics
/// If `page` isn't page-aligned, falls outside the range given to
/// `kinit`, or is freed more times than it was allocated/shared.
pub fn kfree(page: &'static mut Page) {
    let pa = (page as *const Page).addr();
    assert_eq!(pa % PGSIZE, 0, "kfree: unaligned page {pa:#x}");
    let base = BASE.load(Ordering::Relaxed);
    let limit = LIMIT.load(Ordering::Relaxed);
    assert!(pa >= base && pa < limit, "kfree: address {pa:#x} outside managed range");

    let idx = page_index(pa);
    let prev = REFCOUNTS[idx].fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "kfree: refcount underflow on page {pa:#x}");
    if prev == 1 {
        let cpu = idx % NCPU;
        FREELISTS[cpu].with_lock(|fl| fl.put(page));
    }
}

/// Bumps a page's reference count, used when a copy-on-write mapping
/// gains another owner instead of an eager copy.
pub fn inc_refcount(pa: usize) {
    REFCOUNTS[page_index(pa)].fetch_add(1, Ordering::AcqRel);
}

/// Drops a page's reference count by one without touching any free
/// list, for bookkeeping callers that never took ownership of the
/// frame (unlike `kfree`, which both decrements and, at zero, reclaims
/// the page itself). The missing counterpart to `inc_refcount`, kept
/// symmetric for callers that share a frame without ever freeing it.
///
/// # Panics
/// On underflow, same as `kfree`.
pub fn dec_refcount(pa: usize) -> u8 {
    let prev = REFCOUNTS[page_index(pa)].fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "dec_refcount: underflow on page {pa:#x}");
    prev - 1
}

pub fn refcount(pa: usize) -> u8 {
    REFCOUNTS[page_index(pa)].load(Ordering::Acquire)
}

/// Per-frame refcount shard locks, indexed the same way as the
/// refcount table itself. The counters are plain atomics, so nothing
/// in this module needs these to stay correct; they exist so
/// multi-step refcount protocols elsewhere in the crate (fork's
/// lock/increment/unlock sequence in `uvm::copy_range`, grounded on the
/// original's `kreflock`/`inc_refcount`/`krefunlock` bracket) have a
/// real critical section to bracket, rather than just calling the
/// atomic op bare.
static REFLOCKS: [Mutex<()>; NCPU] = [const { Mutex::new("kref", ()) }; NCPU];

pub fn kreflock(pa: usize) {
    REFLOCKS[page_index(pa) % NCPU].acquire();
}

pub fn krefunlock(pa: usize) {
    REFLOCKS[page_index(pa) % NCPU].release();
}


#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> (usize, usize) {
        test_support::ensure_initialized()
    }

    #[test]
    fn alloc_then_free_round_trips() {
        arena();
        let page = kalloc().expect("arena has room");
        let pa = (page as *const Page).addr();
        assert_eq!(refcount(pa), 1);
        assert!(page.0.iter().all(|&b| b == 5), "kalloc must fill the page with its junk sentinel, not zero it");
        kfree(page);
    }

    #[test]
    fn shared_page_survives_one_free() {
        arena();
        let page = kalloc().expect("arena has room");
        let pa = (page as *const Page).addr();
        inc_refcount(pa);
        assert_eq!(refcount(pa), 2);
        kfree(page);
        assert_eq!(refcount(pa), 1);
        let page = unsafe { &mut *(pa as *mut Page) };
        kfree(page);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn double_free_panics() {
        arena();
        let page = kalloc().expect("arena has room");
        let pa = (page as *const Page).addr();
        kfree(page);
        let page = unsafe { &mut *(pa as *mut Page) };
        kfree(page);
    }

    #[test]
    #[should_panic(expected = "unaligned page")]
    fn misaligned_free_panics() {
        arena();
        let page = kalloc().expect("arena has room");
        let pa = (page as *const Page).addr();
        let misaligned = unsafe { &mut *((pa + 1) as *mut Page) };
        kfree(misaligned);
    }

    #[test]
    fn concurrent_alloc_free_is_sound() {
        let (base, limit) = arena();
        let _ = (base, limit);
        let mut handles = Vec::new();
        for _ in 0..16 {
            handles.push(std::thread::spawn(|| {
                for _ in 0..200 {
                    if let Some(page) = kalloc() {
                        assert!(page.0.iter().all(|&b| b == 5));
                        kfree(page);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
