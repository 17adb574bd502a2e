//! Shared test utilities for assembling systems and scripted processes.
//!
//! These helpers de-duplicate boot plumbing across the nucleus and support
//! scenario suites: byte-store expansion for scripted buffers, virtual
//! address helpers, and a couple of canned process shapes.

#![allow(dead_code)]

use crate::consts::*;
use crate::program::{Op, Script};

/// Virtual address of user data page `i` (page 0 is text in the common
/// single-text-page images).
pub fn user_page_addr(i: usize) -> u32 {
    KUSEG_BASE + (i * PAGE_SIZE) as u32
}

/// Scratch address at the bottom of the stack page.
pub fn stack_buf() -> u32 {
    USTACK_PAGE
}

/// One StoreByte op per byte of `bytes`, starting at `addr`.
pub fn store_bytes(addr: u32, bytes: &[u8]) -> Vec<Op> {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| Op::StoreByte(addr + i as u32, b))
        .collect()
}

/// One LoadByte op per address in `addr..addr+n`; loaded values land in
/// the script's return log.
pub fn load_bytes(addr: u32, n: usize) -> Vec<Op> {
    (0..n).map(|i| Op::LoadByte(addr + i as u32)).collect()
}

/// A kernel-mode process that parks forever on a private semaphore.
pub fn block_forever(sem: u32) -> Script {
    Script::kernel(vec![Op::Syscall(SYS_PASSEREN, sem, 0, 0)])
}

pub fn try_init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
