//! Process identity and the collaborator traits this core calls out
//! through instead of owning a scheduler, a filesystem, or a disk
//! driver itself.
//!
//! A full kernel's process module owns a real process table, a real
//! scheduler, and real trapframes; none of that is this core's job.
//! What survives here is the sliver every other module actually
//! touches: "who is currently running" (for sleep-lock ownership and
//! `sleep`/`wakeup`), and typed seams (`BlockDevice`, `Inode`,
//! `FileOps`, `Journal`) that `bio`, `uvm`, and `vma` call into for
//! disk IO, inode metadata, and transaction bracketing. A real kernel
//! built on this core implements these traits over its own disk
//! driver, its own inode cache, and its own log.

use crate::spinlock::SpinMutex;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A stand-in for "the currently running thread of control". Sleep
/// locks and `bio`'s sleep-on-buffer use `pid()` to tell whether the
/// calling context already holds a lock, and `sleep`/`wakeup` to block
/// and resume across a channel, the same contract a full scheduler's
/// `Proc` would honor — minus everything about scheduling, address
/// spaces, or open files,
/// which belong to the embedding kernel's own process struct.
#[derive(Debug)]
pub struct Proc {
    pid: AtomicU32,
    killed: AtomicBool,
}

impl Proc {
    const fn new(pid: u32) -> Proc {
        Proc { pid: AtomicU32::new(pid), killed: AtomicBool::new(false) }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Blocks until `wakeup(chan)` is called, releasing `lock` first and
    /// reacquiring it before returning — the usual release/block/reacquire
    /// contract a kernel `sleep()` offers, so callers that already hold
    /// `lock` can call this without restructuring their loop.
    ///
    /// This core has no scheduler to hand the hart to, so it cannot
    /// truly park the caller; it releases the lock, yields once, and
    /// reacquires it, relying on the caller's own `while condition {
    /// sleep() }` loop to re-check. Correct, if busier than a real
    /// scheduler's sleep queue.
    pub fn sleep(&self, _chan: usize, lock: &SpinMutex<()>) {
        lock.release();
        relax();
        lock.acquire();
    }
}

fn relax() {
    #[cfg(test)]
    std::thread::yield_now();
    #[cfg(not(test))]
    core::hint::spin_loop();
}

/// Wakes every context sleeping on `chan`. This core has no sleep
/// queue to walk — `Proc::sleep`'s callers simply re-poll on their own
/// condition — so this is a documented no-op kept for call-site
/// symmetry with a full kernel's `proc::wakeup`, and as the hook a real
/// scheduler would replace.
pub fn wakeup(_chan: usize) {}

#[cfg(test)]
std::thread_local! {
    static TEST_PROC: Proc = {
        static NEXT_PID: AtomicU32 = AtomicU32::new(1);
        Proc::new(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    };
}

pub type ProcHook = fn() -> &'static Proc;

#[cfg(not(test))]
static MYPROC_HOOK: SpinMutex<Option<ProcHook>> = SpinMutex::new("myproc_hook", None);

/// Installs the embedding kernel's "current process" accessor. Must be
/// called before any code path that might call `myproc()` runs; left
/// unset, `myproc()` panics rather than returning a bogus identity.
#[cfg(not(test))]
pub fn set_myproc_hook(hook: ProcHook) {
    MYPROC_HOOK.with_lock(|h| *h = Some(hook));
}

/// The calling context's process identity. Under test, each host
/// thread gets its own lazily-created `Proc`, so concurrent test
/// threads behave like distinct kernel contexts contending for the
/// same locks. Outside of tests this forwards to the hook the
/// embedding kernel installs with `set_myproc_hook`.
pub fn myproc() -> &'static Proc {
    #[cfg(test)]
    {
        TEST_PROC.with(|p| unsafe { &*(p as *const Proc) })
    }
    #[cfg(not(test))]
    {
        let hook = MYPROC_HOOK.with_lock(|h| *h).expect("myproc hook not installed");
        hook()
    }
}

/// One transaction's worth of write-back bracketing. `vma`'s
/// `MAP_SHARED` writeback and a real filesystem's own syscalls share
/// the same log, so both must bracket their writes with the same
/// `begin_op`/`end_op` pair; the embedding kernel implements this over
/// its own journal.
pub trait Journal: Sync {
    fn begin_op(&self);
    fn end_op(&self);
}

/// A single on-disk inode, locked for the duration of an IO op. The
/// embedding kernel's filesystem implements this over its own inode
/// cache; this core only ever calls these while writing back a dirty
/// `MAP_SHARED` page or reading one in on first fault.
pub trait Inode: Sync {
    fn lock(&self);
    fn unlock(&self);
    /// Reads up to `dst.len()` bytes starting at `off`, returning the
    /// number actually read (short on EOF).
    fn readi(&self, dst: &mut [u8], off: usize) -> crate::KernResult<usize>;
    /// Writes `src` starting at `off`, inside an already-open
    /// transaction. Returns the number of bytes written.
    fn writei(&self, src: &[u8], off: usize) -> crate::KernResult<usize>;
    fn size(&self) -> usize;
}

/// A raw block device, addressed by block number. `bio` is the only
/// module that talks to this directly.
pub trait BlockDevice: Sync {
    fn read(&self, blockno: u32, data: &mut [u8]);
    fn write(&self, blockno: u32, data: &[u8]);
}

/// An open file description, as seen by `vma`'s file-backed mappings,
/// narrowed to what `mmap`'s fault and writeback paths actually need.
pub trait FileOps: Sync {
    fn readable(&self) -> bool;
    fn writable(&self) -> bool;
    fn inode(&self) -> &dyn Inode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_threads_get_distinct_pids() {
        let a = myproc().pid();
        let handle = std::thread::spawn(|| myproc().pid());
        let b = handle.join().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_thread_is_stable() {
        assert_eq!(myproc().pid(), myproc().pid());
    }

    #[test]
    fn kill_flag_round_trips() {
        let p = myproc();
        assert!(!p.killed());
        p.kill();
        assert!(p.killed());
        p.killed.store(false, Ordering::Relaxed);
    }
}
