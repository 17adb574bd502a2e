/*!
Nucleus services, numbers 1..8.

All of them require kernel mode; a user-mode caller is rewritten as a
reserved-instruction trap and takes the program-trap path. Before any
service runs, the saved PC steps past the trapping instruction and the
saved state is copied into the current PCB, so a blocking service suspends
the caller exactly where it will resume.

Numbers at or above 9 (and anything unrecognizable) are not nucleus
business: they pass up on the general path.
*/

use log::trace;

use crate::consts::*;
use crate::machine::Machine;
use crate::nucleus::{Abend, Kernel, Prio, SpawnArgs};
use crate::program::ExcSlot;
use crate::state::{Cause, ExcCode};
use crate::support::SupportLayer;

impl Kernel {
    pub(crate) fn on_syscall(
        &mut self,
        m: &mut Machine,
        sup: &mut SupportLayer,
        spawn: Option<SpawnArgs>,
    ) -> Result<(), Abend> {
        let saved = m.bios.saved.clone();
        let pid = self.current.ok_or(Abend::NoCurrentProcess)?;
        let num = saved.a(0);
        let nucleus_service = (SYS_CREATE_PROCESS..=SYS_GET_SUPPORT).contains(&num);

        if nucleus_service && saved.status.user_mode() {
            // Privileged service request from user mode: demote to a
            // reserved-instruction program trap.
            m.bios.saved.cause = Cause::exception(ExcCode::ReservedInstruction);
            self.pcbs.get_mut(pid).state = m.bios.saved.clone();
            self.pass_up_or_die(m, sup, ExcSlot::General);
            return Ok(());
        }
        if !nucleus_service {
            self.pcbs.get_mut(pid).state = saved;
            self.pass_up_or_die(m, sup, ExcSlot::General);
            return Ok(());
        }

        let mut state = saved;
        state.advance_pc();
        self.pcbs.get_mut(pid).state = state;
        let (a1, a2, a3) = (
            self.pcbs.get(pid).state.a(1),
            self.pcbs.get(pid).state.a(2),
            self.pcbs.get(pid).state.a(3),
        );
        trace!("pid {pid} SYS{num}({a1:#x}, {a2:#x}, {a3:#x})");

        match num {
            SYS_CREATE_PROCESS => self.sys_create(pid, spawn),
            SYS_TERMINATE_PROCESS => self.terminate_tree(pid),
            SYS_PASSEREN => {
                if self.sems.dec(a1) < 0 {
                    self.block_current(a1);
                }
            }
            SYS_VERHOGEN => self.verhogen(a1),
            SYS_WAIT_IO => self.sys_wait_io(m, sup, pid, a1, a2, a3),
            SYS_GET_CPU_TIME => {
                let t = self.pcbs.get(pid).cpu_time;
                self.pcbs.get_mut(pid).state.set_v0(t as u32);
            }
            SYS_WAIT_CLOCK => {
                let addr = dev_sem_addr(PSEUDO_CLOCK_SEM);
                if self.sems.dec(addr) < 0 {
                    self.soft_block_count += 1;
                    self.block_current(addr);
                }
            }
            SYS_GET_SUPPORT => {
                let asid = self.pcbs.get(pid).support.unwrap_or(0);
                self.pcbs.get_mut(pid).state.set_v0(asid as u32);
            }
            _ => unreachable!("range-checked above"),
        }
        Ok(())
    }

    fn sys_create(&mut self, parent: crate::nucleus::Pid, spawn: Option<SpawnArgs>) {
        let Some(args) = spawn else {
            // A bare SYS1 with nothing to run cannot produce a process.
            self.pcbs.get_mut(parent).state.set_v0(u32::MAX);
            return;
        };
        match self.pcbs.alloc() {
            None => self.pcbs.get_mut(parent).state.set_v0(u32::MAX),
            Some(child) => {
                let c = self.pcbs.get_mut(child);
                c.state = args.state;
                c.support = args.support;
                c.body = Some(args.body);
                self.pcbs.insert_child(parent, child);
                self.make_ready(child, Prio::High);
                self.process_count += 1;
                self.pcbs.get_mut(parent).state.set_v0(0);
                trace!("pid {parent} spawned pid {child}");
            }
        }
    }

    /// V: release one sleeper (FIFO) if the counter stays at or below zero.
    pub(crate) fn verhogen(&mut self, sem_addr: u32) {
        if self.sems.inc(sem_addr) <= 0 {
            if let Some(w) = self.asl.remove_blocked(&mut self.pcbs, sem_addr) {
                self.make_ready(w, Prio::High);
            }
        }
    }

    fn sys_wait_io(
        &mut self,
        m: &Machine,
        sup: &mut SupportLayer,
        pid: crate::nucleus::Pid,
        line: u32,
        dev: u32,
        recv: u32,
    ) {
        let (line, dev) = (line as usize, dev as usize);
        if !(FIRST_DEV_LINE..=LAST_DEV_LINE).contains(&line)
            || dev >= DEV_PER_LINE
            || (recv != 0 && line != LINE_TERMINAL)
        {
            self.pass_up_or_die(m, sup, ExcSlot::General);
            return;
        }
        let idx = dev_sem_index(line, dev, recv != 0);
        let addr = dev_sem_addr(idx);
        if self.sems.dec(addr) < 0 {
            self.soft_block_count += 1;
            self.block_current(addr);
        } else {
            // The completion already happened; hand back its latched status.
            let status = self.dev_status(idx);
            self.pcbs.get_mut(pid).state.set_v0(status);
        }
    }
}
