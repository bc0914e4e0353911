#![allow(dead_code)]

use crate::riscv::PGSIZE;

/// Simulated hart count. Real deployments would take this from the
/// device tree; a teaching kernel hardcodes it instead.
pub const NCPU: usize = 8;

/// Disk block size. Kept equal to PGSIZE, so a buffer's backing
/// storage is exactly one frame.
pub const BSIZE: usize = PGSIZE;

/// Number of cached blocks. Buffer-cache exhaustion has nowhere to
/// fall back to — every caller of `bget` expects a buffer back — so
/// callers are expected to size this for their transaction peak.
pub const NBUF: usize = 64;

/// Upper bound on the number of physical frames this core can track at
/// once. Real hardware would size this off the device tree; fixed here
/// so the per-frame reference-count table can be a plain static array.
/// `kinit` asserts the caller's `[first_usable, phystop)` range fits.
pub const MAXPAGES: usize = 65536;

/// Hash bucket count for the buffer cache — a small prime.
pub const NBUCKET: usize = 13;

/// Per-process VMA table capacity.
pub const NVMA: usize = 16;

/// Max outstanding blocks in one filesystem transaction; used only to
/// size the `Journal` test fakes, since the real log lives outside
/// this crate's scope.
pub const MAXOPBLOCKS: usize = 10;

/// Ceiling on live processes, needed only to size the `Proc` table the
/// collaborator stubs use in tests.
pub const NPROC: usize = 64;

pub const NOFILE: usize = 16;
