//! End-to-end tests that exercise more than one module together, the
//! way a real fault or syscall path would: a fork that actually shares
//! and then splits a frame, a heap growth immediately followed by a
//! read, concurrent cache traffic across more threads than buckets, and
//! an mmap region that round-trips through a backing file. Per-module
//! invariants have their own unit tests next to the code they cover;
//! these are about the seams between modules.

use crate::file::fake::FakeFile;
use crate::file::FileHandle;
use crate::kalloc::{self, test_support};
use crate::param::{NBUCKET, NBUF};
use crate::proc::{BlockDevice, Journal};
use crate::riscv::{self, PGSIZE};
use crate::uvm::AddressSpace;
use crate::vma::{self, Prot};

fn arena() {
    test_support::ensure_initialized();
}

struct MemDisk;
impl BlockDevice for MemDisk {
    fn read(&self, _blockno: u32, data: &mut [u8]) {
        data.fill(0);
    }
    fn write(&self, _blockno: u32, _data: &[u8]) {}
}
static DISK: MemDisk = MemDisk;

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

/// Fork a two-page address space, have both parent and child write a
/// distinct byte into the shared region, and confirm each keeps its
/// own value in its own frame while the original frame's reference
/// count settles back to one once nobody shares it anymore.
#[test]
fn cow_fork_diverges_into_private_frames_on_write() {
    arena();
    let mut parent = AddressSpace::new().unwrap();
    parent.uvminit(&[0]).unwrap();
    parent.uvmalloc(parent.size(), 0x4000).unwrap();

    let mut child = AddressSpace::new().unwrap();
    parent.uvmcopy(&mut child).unwrap();

    let shared_pa = parent.pagetable().walkaddr(0x2000).unwrap();
    assert_eq!(child.pagetable().walkaddr(0x2000), Some(shared_pa));
    assert_eq!(kalloc::refcount(shared_pa), 2, "one reference per address space");

    parent.copyout(0x2000, b"X").unwrap();
    child.copyout(0x2000, b"Y").unwrap();

    let parent_pa = parent.pagetable().walkaddr(0x2000).unwrap();
    let child_pa = child.pagetable().walkaddr(0x2000).unwrap();
    assert_ne!(parent_pa, child_pa, "each writer must land on its own frame");
    assert_eq!(kalloc::refcount(shared_pa), 1, "original frame is now privately held by whichever side kept it");

    let mut pbuf = [0u8; 1];
    let mut cbuf = [0u8; 1];
    parent.copyin(&mut pbuf, 0x2000).unwrap();
    child.copyin(&mut cbuf, 0x2000).unwrap();
    assert_eq!(pbuf, *b"X");
    assert_eq!(cbuf, *b"Y");
}

/// Growing `sz` past a page boundary and immediately reading a byte
/// from the middle of the new region must succeed and come back
/// zeroed, regardless of whether growth mapped the frame eagerly or
/// left it to be serviced by the fault path.
#[test]
fn heap_growth_then_read_of_untouched_byte_comes_back_zero() {
    arena();
    let mut asp = AddressSpace::new().unwrap();
    asp.uvminit(&[0]).unwrap();
    let sz = asp.uvmalloc(asp.size(), 0x3000).unwrap();
    assert_eq!(sz, 0x3000);

    let mut byte = [0xffu8];
    asp.copyin(&mut byte, 0x2000).expect("byte in the freshly grown range must be readable");
    assert_eq!(byte, [0u8], "a never-written page must read as zero");
}

/// Sixteen threads each pull a distinct block through the cache at
/// once; none may observe another thread's block or dev, and none may
/// panic contending for a bucket lock.
#[test]
fn sixteen_concurrent_readers_each_see_their_own_block() {
    let dev = crate::bio::test_support::ensure_binit();
    let mut handles = Vec::new();
    for i in 0..16u32 {
        handles.push(std::thread::spawn(move || {
            let b = crate::bio::bread(&DISK, dev, i);
            assert_eq!(b.dev(), dev);
            assert_eq!(b.blockno(), i);
            std::thread::sleep(std::time::Duration::from_millis(1));
            crate::bio::brelse(b);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

/// Drain bucket zero's own unused list, then ask for one more block
/// that hashes there: the cache must recycle a buffer stolen from some
/// other bucket rather than failing, since a healthy cache never runs
/// out as long as some bucket still has a spare.
#[test]
fn a_dry_bucket_steals_a_spare_from_its_neighbor() {
    let dev = crate::bio::test_support::ensure_binit();
    let mut pinned = Vec::new();
    let mut blockno = 0u32;
    while pinned.len() < (NBUF / NBUCKET) + 1 {
        let b = crate::bio::bget(dev, blockno);
        if (b.blockno() as usize) % NBUCKET != 0 {
            crate::bio::brelse(b);
            blockno += 1;
            continue;
        }
        pinned.push(b);
        blockno += NBUCKET as u32;
    }

    let extra = crate::bio::bget(dev, blockno);
    assert_eq!((extra.blockno() as usize) % NBUCKET, 0);
    crate::bio::brelse(extra);
    for b in pinned {
        crate::bio::brelse(b);
    }
}

/// Map a two-page `MAP_SHARED` region, write only into its second
/// page, unmap the whole thing, and confirm the file only changed at
/// the offset that was actually touched.
#[test]
fn shared_mmap_writeback_lands_only_on_the_dirty_page() {
    arena();
    let mut asp = AddressSpace::new().unwrap();
    asp.uvminit(&[0]).unwrap();
    let file = leak_file(vec![0u8; 2 * PGSIZE]);

    let base = riscv::TRAPFRAME - 2 * PGSIZE;
    let idx = vma::map_vma(&mut asp, base, riscv::TRAPFRAME, Prot::READ | Prot::WRITE, true, file, 0).unwrap();
    asp.page_fault_handler(base).unwrap();
    asp.page_fault_handler(base + PGSIZE).unwrap();
    asp.copyout(base + PGSIZE, b"second page").unwrap();

    vma::unmap_vma(&mut asp, &JOURNAL, idx, base, riscv::TRAPFRAME).unwrap();

    let inode = file.ops().inode();
    let mut buf = [0u8; 2 * PGSIZE];
    inode.readi(&mut buf, 0).unwrap();
    assert!(buf[..PGSIZE].iter().all(|&b| b == 0), "the untouched page must still read as zero");
    assert_eq!(&buf[PGSIZE..PGSIZE + 11], b"second page");
}

/// A `copyin` spanning the boundary at `PLIC` must stitch its fast and
/// slow halves back into one contiguous read, each coming from the
/// path appropriate to its side of the split.
#[test]
fn copyin_across_plic_reassembles_one_contiguous_buffer() {
    arena();
    let mut asp = AddressSpace::new().unwrap();
    asp.uvminit(&[0]).unwrap();
    asp.set_size(riscv::PLIC + PGSIZE);

    let below = riscv::PLIC - PGSIZE;
    let above = riscv::PLIC;
    asp.page_fault_handler(below).unwrap();
    asp.page_fault_handler(above).unwrap();
    asp.copyout(below, &[1u8; PGSIZE]).unwrap();
    asp.copyout(above, &[2u8; PGSIZE]).unwrap();

    let mut buf = [0u8; 2 * PGSIZE];
    asp.copyin(&mut buf, below).unwrap();
    assert!(buf[..PGSIZE].iter().all(|&b| b == 1));
    assert!(buf[PGSIZE..].iter().all(|&b| b == 2));
}
