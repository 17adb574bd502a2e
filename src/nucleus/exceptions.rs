/*!
Exception decode, pass-up-or-die, and process termination.

The trampoline stores the trap-time state in the BIOS data page and calls
`on_exception`. Decode routes on the cause's ExcCode: interrupts to the
interrupt handler, syscalls to the service decoder, TLB exceptions up the
page-fault path, and every other program trap up the general path.

Pass-up-or-die: a process with a support structure gets the saved state
copied into the matching support slot and continues in its handler context;
a process without one is dismantled together with its whole subtree.
*/

use log::{trace, warn};

use crate::machine::Machine;
use crate::nucleus::pcb::Location;
use crate::nucleus::{Abend, Kernel, Pid, SpawnArgs};
use crate::program::ExcSlot;
use crate::state::ExcCode;
use crate::support::SupportLayer;

impl Kernel {
    /// Entry point for every trap. The saved state sits in the BIOS page;
    /// `spawn` carries the create-process payload when the trap is SYS1.
    pub fn on_exception(
        &mut self,
        m: &mut Machine,
        sup: &mut SupportLayer,
        spawn: Option<SpawnArgs>,
    ) -> Result<(), Abend> {
        let cause = m.bios.saved.cause;
        let code = cause.exc_code().ok_or(Abend::UnknownException(cause.0))?;
        self.charge_time(m);
        trace!("exception {code:?} at {}us", m.now());

        match code {
            ExcCode::Interrupt => self.handle_interrupt(m, cause),
            ExcCode::Syscall => self.on_syscall(m, sup, spawn),
            c if c.is_tlb() => {
                let pid = self.current.ok_or(Abend::NoCurrentProcess)?;
                self.pcbs.get_mut(pid).state = m.bios.saved.clone();
                self.pass_up_or_die(m, sup, ExcSlot::PageFault);
                Ok(())
            }
            _ => {
                let pid = self.current.ok_or(Abend::NoCurrentProcess)?;
                self.pcbs.get_mut(pid).state = m.bios.saved.clone();
                self.pass_up_or_die(m, sup, ExcSlot::General);
                Ok(())
            }
        }
    }

    /// Forward the saved exception state to the current process's support
    /// level, or terminate the offender and its descendants.
    pub(crate) fn pass_up_or_die(&mut self, m: &Machine, sup: &mut SupportLayer, slot: ExcSlot) {
        let pid = self.current.expect("pass-up with no current process");
        let asid = self.pcbs.get(pid).support.filter(|&a| sup.get(a).is_some());
        match asid {
            Some(asid) => {
                sup.get_mut(asid).expect("support struct vanished").saved[slot.index()] =
                    m.bios.saved.clone();
                self.pcbs.get_mut(pid).passup_pending[slot.index()] = true;
                trace!("pass up {slot:?} to asid {asid}");
            }
            None => {
                warn!(
                    "pid {pid} trapped ({:?}) with no support level, terminating",
                    m.bios.saved.cause.exc_code()
                );
                self.terminate_tree(pid);
            }
        }
    }

    /// Depth-first teardown of a process and all of its descendants.
    pub fn terminate_tree(&mut self, root: Pid) {
        while let Some(child) = self.pcbs.remove_first_child(root) {
            self.terminate_tree(child);
        }
        self.remove_one(root);
    }

    fn remove_one(&mut self, pid: Pid) {
        match self.pcbs.get(pid).location {
            Location::Blocked(addr) => {
                self.asl.out_blocked(&mut self.pcbs, pid);
                if Kernel::is_device_sem(addr) {
                    self.soft_block_count -= 1;
                } else {
                    // The V this sleeper was owed will never be consumed.
                    self.sems.inc(addr);
                }
            }
            Location::Ready(crate::nucleus::Prio::High) => {
                self.ready_high.remove(&mut self.pcbs, pid);
            }
            Location::Ready(crate::nucleus::Prio::Low) => {
                self.ready_low.remove(&mut self.pcbs, pid);
            }
            Location::Current => {
                self.current = None;
            }
            Location::Free => {
                debug_assert!(false, "terminating a free PCB");
            }
        }
        self.pcbs.detach_from_parent(pid);
        self.pcbs.free(pid);
        self.process_count -= 1;
        trace!("pid {pid} terminated, {} processes left", self.process_count);
    }
}
