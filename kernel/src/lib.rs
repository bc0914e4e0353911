//! Memory-management and block-cache core for a small teaching kernel.
//!
//! This crate implements three subsystems: the per-CPU page allocator
//! (`kalloc`), the Sv39
//! page-table engine and address-space manager (`pagetable`, `uvm`,
//! `vma`, `kvm`), and the bucketed buffer cache (`bio`). Everything else a
//! real kernel needs — the scheduler, trap/syscall entry, the on-disk
//! filesystem, the virtio driver, the console — is modeled only as the
//! collaborator traits in `proc` and `file` that this core calls into.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::upper_case_acronyms)]

pub mod bio;
pub mod file;
pub mod kalloc;
pub mod klog;
pub mod kvm;
pub mod pagetable;
pub mod param;
pub mod proc;
pub mod riscv;
pub mod sleeplock;
pub mod spinlock;
pub mod uvm;
pub mod vma;

#[cfg(test)]
mod scenarios;

/// Error taxonomy for the caller-surfaced half of this crate's failure
/// modes (invariant violations stay as `panic!` rather than a
/// `KernError` variant).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernError {
    OutOfMemory,
    BadAddress,
    VmaOverlap,
    VmaFull,
    BadUnmapRange,
    Io,
}

pub type KernResult<T> = core::result::Result<T, KernError>;

// This crate is linked into a larger kernel binary, which supplies the
// `#[panic_handler]` and the `#[global_allocator]` (if any); neither
// belongs here.
