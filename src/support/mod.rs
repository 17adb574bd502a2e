/*!
The support layer: per-process kernel-mode services above the nucleus.

A user process owns a support structure for the whole of its life: two
saved exception states with their handler contexts, a 32-entry page table,
the private semaphore the delay facility signals, and bookkeeping for
cleanup (which device mutex is held, whether the swap-pool mutex is held).
Structures come from a fixed pool indexed by ASID.

The swap pool is the shared frame array all user processes page in and
out of; its entries carry the owning ASID, the page's VPN and page-table
index, and the dirty/valid bits the pager maintains under the swap-pool
mutex.

Submodules:
- `blockio`       the program-registers / block-wait / acknowledge protocol
- `pager`         page-fault resolution and TLB refill
- `services`      syscalls 9..18 and the termination cleanup
- `delay`         the Active Delay List and the delay daemon
- `instantiator`  the boot process that builds and launches user processes
*/

pub mod blockio;
pub mod delay;
pub mod instantiator;
pub mod pager;
pub mod services;

use crate::consts::*;
use crate::machine::tlb::{TlbEntry, entry_hi};
use crate::nucleus::asl::SemSpace;
use crate::program::Program;
use crate::state::{ProcessorState, Status};
use delay::Adl;

/// An exception context: where a pass-up resumes execution.
#[derive(Debug, Clone, Copy)]
pub struct ExcContext {
    pub pc: u32,
    pub sp: u32,
    pub status: Status,
}

impl Default for ExcContext {
    fn default() -> Self {
        ExcContext {
            pc: 0,
            sp: 0,
            status: Status::kernel_run(),
        }
    }
}

pub struct SupportStruct {
    pub asid: usize,
    /// Saved exception states: [page-fault, general].
    pub saved: [ProcessorState; 2],
    pub contexts: [ExcContext; 2],
    pub page_table: [TlbEntry; PAGETBL_SIZE],
    /// Bytes of read-only text at the front of the image.
    pub text_size: u32,
    /// Device mutex currently held, released if the process dies mid-I/O.
    pub held_mutex: Option<u32>,
    /// Whether the process holds the swap-pool mutex (the pager's own
    /// death path must not take it twice).
    pub holding_swap: bool,
}

impl SupportStruct {
    pub fn new(asid: usize, text_size: u32) -> Self {
        let mut page_table = [TlbEntry::default(); PAGETBL_SIZE];
        for (i, pte) in page_table.iter_mut().enumerate() {
            pte.hi = entry_hi(vpn_of_page(i), asid);
            pte.lo = 0;
        }
        SupportStruct {
            asid,
            saved: [ProcessorState::default(), ProcessorState::default()],
            contexts: [
                ExcContext {
                    pc: PAGER_ENTRY,
                    sp: support_stack_top(asid),
                    status: Status::kernel_run(),
                },
                ExcContext {
                    pc: SUPPORT_GEN_ENTRY,
                    sp: support_stack_top(asid),
                    status: Status::kernel_run(),
                },
            ],
            page_table,
            text_size,
            held_mutex: None,
            holding_swap: false,
        }
    }

    pub fn private_sem(&self) -> u32 {
        private_sem_addr(self.asid)
    }
}

/// VPN backing page-table entry `i`: 31 consecutive text/data pages from
/// the segment base, then the stack page.
pub fn vpn_of_page(i: usize) -> u32 {
    if i == STACK_PTE {
        USTACK_VPN
    } else {
        KUSEG_VPN + i as u32
    }
}

/// Page-table index for a VPN, or None when the address is outside the
/// process's address space.
pub fn page_index(vpn: u32) -> Option<usize> {
    if vpn == USTACK_VPN {
        Some(STACK_PTE)
    } else if (KUSEG_VPN..KUSEG_VPN + (PAGETBL_SIZE - 1) as u32).contains(&vpn) {
        Some((vpn - KUSEG_VPN) as usize)
    } else {
        None
    }
}

/// One frame of the shared swap pool.
#[derive(Debug, Clone, Copy)]
pub struct SwapEntry {
    /// Owning ASID; None marks the frame unoccupied.
    pub asid: Option<usize>,
    pub vpn: u32,
    /// Back-reference into the owner's page table.
    pub pte_index: usize,
    /// Mirrors the owner's PTE valid bit (cleared during eviction).
    pub valid: bool,
    pub dirty: bool,
}

impl SwapEntry {
    fn empty() -> Self {
        SwapEntry {
            asid: None,
            vpn: 0,
            pte_index: 0,
            valid: false,
            dirty: false,
        }
    }
}

/// Physical address of swap-pool frame `i`.
pub fn swap_frame_addr(i: usize) -> u32 {
    frame_addr(SWAP_POOL_FRAME + i)
}

pub struct SupportLayer {
    structs: Vec<Option<SupportStruct>>,
    pub swap: Vec<SwapEntry>,
    /// FIFO rotation hand for frame replacement.
    pub swap_next: usize,
    pub adl: Adl,
    /// Bodies of user processes awaiting creation, indexed by ASID-1.
    pub registry: Vec<Option<Box<dyn Program>>>,
}

impl SupportLayer {
    pub fn new() -> Self {
        SupportLayer {
            structs: (0..UPROC_MAX).map(|_| None).collect(),
            swap: vec![SwapEntry::empty(); SWAP_POOL_SIZE],
            swap_next: 0,
            adl: Adl::new(),
            registry: Vec::new(),
        }
    }

    /// Boot-time initialization of every support-layer semaphore: device
    /// mutexes, the swap-pool and delay-list mutexes at 1, the master
    /// termination semaphore and the private semaphores at 0.
    pub fn init(&mut self, sems: &mut SemSpace) {
        for i in 0..DEV_SEM_COUNT {
            sems.define(dev_mutex_addr(i), 1);
        }
        sems.define(SWAP_MUTEX_ADDR, 1);
        sems.define(ADL_MUTEX_ADDR, 1);
        sems.define(MASTER_SEM_ADDR, 0);
        for asid in 1..=UPROC_MAX {
            sems.define(private_sem_addr(asid), 0);
        }
    }

    /// Claim the support structure for `asid`. Fails if already in use or
    /// out of range.
    pub fn alloc(&mut self, asid: usize, text_size: u32) -> bool {
        if asid == 0 || asid > self.structs.len() || self.structs[asid - 1].is_some() {
            return false;
        }
        self.structs[asid - 1] = Some(SupportStruct::new(asid, text_size));
        true
    }

    /// Return a structure to the pool.
    pub fn free(&mut self, asid: usize) {
        if asid >= 1 && asid <= self.structs.len() {
            self.structs[asid - 1] = None;
        }
    }

    pub fn get(&self, asid: usize) -> Option<&SupportStruct> {
        self.structs.get(asid.checked_sub(1)?)?.as_ref()
    }

    pub fn get_mut(&mut self, asid: usize) -> Option<&mut SupportStruct> {
        self.structs.get_mut(asid.checked_sub(1)?)?.as_mut()
    }

    /// Frame selection: any unoccupied frame first, else advance the
    /// rotation hand.
    pub fn pick_frame(&mut self) -> usize {
        if let Some(i) = self.swap.iter().position(|e| e.asid.is_none()) {
            return i;
        }
        self.swap_next = (self.swap_next + 1) % self.swap.len();
        self.swap_next
    }

    /// Drop every swap-pool entry owned by `asid` (termination sweep).
    /// Returns the (vpn, frame) pairs that were released so the caller can
    /// scrub the TLB.
    pub fn release_frames_of(&mut self, asid: usize) -> Vec<(u32, usize)> {
        let mut released = Vec::new();
        for (i, e) in self.swap.iter_mut().enumerate() {
            if e.asid == Some(asid) {
                released.push((e.vpn, i));
                *e = SwapEntry::empty();
            }
        }
        released
    }
}

impl Default for SupportLayer {
    fn default() -> Self {
        SupportLayer::new()
    }
}
