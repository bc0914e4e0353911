//! A reference-counted handle to an open file — the unit `vma::map_vma`
//! and `vma::unmap_vma` duplicate and close, generalized over the
//! `proc::FileOps` trait boundary instead of a concrete dispatch table,
//! since this core never allocates or owns files itself (the embedding
//! kernel's filesystem does; the on-disk format and the file table are
//! out of scope here).

use crate::proc::FileOps;
use core::sync::atomic::{AtomicU32, Ordering};

/// Wraps a `'static` file implementation with the refcount `mmap`
/// needs to decide when a file truly goes away. The embedding kernel
/// allocates the underlying `FileOps` (its own `open`/`dup` syscalls
/// build on top of this); this core only ever dups and closes handles
/// it's handed.
pub struct FileHandle {
    ops: &'static dyn FileOps,
    refcnt: AtomicU32,
}

impl FileHandle {
    pub fn new(ops: &'static dyn FileOps) -> FileHandle {
        FileHandle { ops, refcnt: AtomicU32::new(1) }
    }

    pub fn ops(&self) -> &'static dyn FileOps {
        self.ops
    }

    /// `filedup`: bumps the refcount and hands back the same handle, so
    /// every VMA that shares a backing file keeps the same identity.
    pub fn dup(&self) -> &FileHandle {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        self
    }

    /// `fileclose`: drops the refcount, returning what's left. This
    /// core has no file table of its own to recycle a slot in once the
    /// count reaches zero — that's the embedding kernel's job.
    pub fn close(&self) -> u32 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "fileclose: refcount underflow");
        prev - 1
    }
}
