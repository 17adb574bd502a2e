/*!
Page-fault resolution over the shared swap pool, and TLB refill.

A fault enters on the page-fault pass-up path. The pager terminates the
faulter outright for TLB-modification exceptions and for addresses outside
the user segment; everything else resolves under the swap-pool mutex:

1. pick a frame: any unoccupied one, else the FIFO rotation hand;
2. if occupied, downgrade the victim: clear its PTE valid bit and rewrite
   any stale TLB entry in one un-interleaved step, then write the page back
   to the victim's backing store if it was dirty;
3. read the faulting page from the owner's backing store into the frame;
4. install: update the swap entry and the PTE (valid, dirty for non-text
   pages), refresh the TLB by probe-then-rewrite, release the mutex and
   reload the saved state to retry the access.

The backing store is flash device `asid-1`: block k holds virtual page k,
so the initially-loaded image doubles as the paging store and clean text
pages are never written back. Device errors terminate the caller.

TLB refill is the fast path: on a miss the current page table entry is
copied into a random TLB slot and the access retries; an invalid entry then
re-traps as a page fault.
*/

use log::{debug, warn};

use crate::consts::*;
use crate::machine::Machine;
use crate::machine::tlb::entry_lo;
use crate::program::{Action, Ctx, ExcSlot};
use crate::state::{ExcCode, ProcessorState};
use crate::support::blockio::{BlockIo, IoStep};
use crate::support::services::Terminator;
use crate::support::{SupportStruct, page_index, swap_frame_addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    AwaitMutex,
    Evict,
    Load,
    Release,
}

pub struct Pager {
    stage: Stage,
    vpn: u32,
    page_idx: usize,
    frame: usize,
    io: Option<BlockIo>,
    die: Option<Terminator>,
}

impl Pager {
    /// Decode the fault from the saved state. Modification exceptions and
    /// out-of-segment addresses go straight to the termination path.
    pub fn new(saved: &ProcessorState) -> Self {
        let vpn = saved.fault_vpn();
        let die = match (saved.cause.exc_code(), page_index(vpn)) {
            (Some(ExcCode::TlbModify), _) => {
                warn!("write to a protected page at vpn {vpn:#x}, terminating");
                Some(Terminator::new())
            }
            (_, None) => {
                warn!("page fault outside the user segment (vpn {vpn:#x}), terminating");
                Some(Terminator::new())
            }
            (_, Some(_)) => None,
        };
        Pager {
            stage: Stage::Start,
            vpn,
            page_idx: page_index(vpn).unwrap_or(0),
            frame: 0,
            io: None,
            die,
        }
    }

    pub fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        if let Some(t) = self.die.as_mut() {
            return t.step(cx, asid);
        }
        match self.stage {
            Stage::Start => {
                self.stage = Stage::AwaitMutex;
                Action::Syscall {
                    code: SYS_PASSEREN,
                    a1: SWAP_MUTEX_ADDR,
                    a2: 0,
                    a3: 0,
                }
            }
            Stage::AwaitMutex => {
                if let Some(s) = cx.support.get_mut(asid) {
                    s.holding_swap = true;
                }
                self.frame = cx.support.pick_frame();
                let entry = cx.support.swap[self.frame];
                debug!(
                    "pager asid {asid} vpn {:#x} -> frame {} (victim: {:?})",
                    self.vpn, self.frame, entry.asid
                );
                if let Some(victim) = entry.asid {
                    // Downgrade the victim's translation before the frame
                    // contents can change: PTE valid off, stale TLB entry
                    // rewritten in place. No schedulable point intervenes.
                    if let Some(vs) = cx.support.get_mut(victim) {
                        vs.page_table[entry.pte_index].lo &= !crate::machine::tlb::ENTRYLO_VALID;
                    }
                    cx.support.swap[self.frame].valid = false;
                    if let Some(slot) = cx.machine.tlb.probe(entry.vpn, victim) {
                        let e = cx.machine.tlb.read(slot);
                        cx.machine
                            .tlb
                            .write(slot, e.hi, e.lo & !crate::machine::tlb::ENTRYLO_VALID);
                    }
                    if entry.dirty {
                        self.io = Some(BlockIo::flash(
                            victim - 1,
                            entry.pte_index as u32,
                            swap_frame_addr(self.frame),
                            true,
                        ));
                        self.stage = Stage::Evict;
                        return self.drive_io(cx, asid);
                    }
                }
                self.begin_load(cx, asid)
            }
            Stage::Evict => match self.io.as_mut().expect("evict without io").step(cx, Some(asid)) {
                IoStep::Do(a) => a,
                IoStep::Done(status) if status == STAT_READY => self.begin_load(cx, asid),
                IoStep::Done(status) => self.die_on_device(cx, asid, status),
            },
            Stage::Load => match self.io.as_mut().expect("load without io").step(cx, Some(asid)) {
                IoStep::Do(a) => a,
                IoStep::Done(status) if status == STAT_READY => self.install(cx, asid),
                IoStep::Done(status) => self.die_on_device(cx, asid, status),
            },
            Stage::Release => Action::Resume(ExcSlot::PageFault),
        }
    }

    fn begin_load(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        self.io = Some(BlockIo::flash(
            asid - 1,
            self.page_idx as u32,
            swap_frame_addr(self.frame),
            false,
        ));
        self.stage = Stage::Load;
        self.drive_io(cx, asid)
    }

    fn drive_io(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        match self.io.as_mut().expect("io missing").step(cx, Some(asid)) {
            IoStep::Do(a) => a,
            IoStep::Done(_) => unreachable!("fresh block io cannot be done"),
        }
    }

    /// Install the new translation and hand the mutex back.
    fn install(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        let text_size = cx.support.get(asid).map(|s| s.text_size).unwrap_or(0);
        let writable =
            self.page_idx == STACK_PTE || (self.page_idx * PAGE_SIZE) as u32 >= text_size;
        let frame_pa = swap_frame_addr(self.frame);

        cx.support.swap[self.frame] = crate::support::SwapEntry {
            asid: Some(asid),
            vpn: self.vpn,
            pte_index: self.page_idx,
            valid: true,
            dirty: writable,
        };
        if let Some(s) = cx.support.get_mut(asid) {
            s.page_table[self.page_idx].lo = entry_lo(frame_pa, true, writable);
            s.holding_swap = false;
            let pte = s.page_table[self.page_idx];
            if let Some(slot) = cx.machine.tlb.probe(self.vpn, asid) {
                cx.machine.tlb.write(slot, pte.hi, pte.lo);
            }
        }
        debug!(
            "pager asid {asid} installed vpn {:#x} in frame {} ({})",
            self.vpn,
            self.frame,
            if writable { "writable" } else { "text" }
        );
        self.stage = Stage::Release;
        Action::Syscall {
            code: SYS_VERHOGEN,
            a1: SWAP_MUTEX_ADDR,
            a2: 0,
            a3: 0,
        }
    }

    fn die_on_device(&mut self, cx: &mut Ctx<'_>, asid: usize, status: u32) -> Action {
        warn!("pager asid {asid}: backing store error status {status}, terminating");
        let mut t = Terminator::new();
        let a = t.step(cx, asid);
        self.die = Some(t);
        a
    }
}

/// TLB refill: copy the current process's translation for `vpn` into a
/// random TLB slot. The entry may be invalid; the retried access then
/// raises the real page fault.
pub fn tlb_refill(m: &mut Machine, sup: &SupportStruct, vpn: u32) {
    if let Some(idx) = page_index(vpn) {
        let pte = sup.page_table[idx];
        let slot = m.tlb.write_random(m.now(), pte.hi, pte.lo);
        log::trace!("tlb refill vpn {vpn:#x} -> slot {slot}");
    }
}
