/*!
The trampoline: boot, dispatch loop, and the machine/kernel seam.

`System` owns the board, the nucleus, and the support layer, and runs the
loop the hardware would: pick up the current process's next unit of work,
move virtual time, store trap states into the BIOS page, and call the
kernel's exception entry. It also performs the state loads the kernel asks
for, because only the machine boundary may do that.

Order of operations per step (mirrors the hardware's priorities):
1. no current process → scheduler decision (run / wait-for-interrupt /
   halt / deadlock);
2. deliverable pending interrupt → exception entry;
3. unfinished work (a preempted computation, an un-retired memory access)
   → continue it;
4. otherwise ask the process's runnable (page-fault handler first, then
   general handler, then the body) for its next action and apply it.

`SystemBuilder` assembles a bootable machine: user programs with their
flash images, terminal input, and the instantiator as first process.
*/

use log::{error, info};
use thiserror::Error;

use crate::consts::*;
use crate::machine::Machine;
use crate::nucleus::pcb::{Access, AccessKind, PendingWork};
use crate::nucleus::sched::Sched;
use crate::nucleus::{Abend, Kernel, Pid, SpawnArgs};
use crate::program::{Action, Ctx, ExcSlot, Program, Resume};
use crate::state::{Cause, ExcCode, ProcessorState, Status};
use crate::support::instantiator::Instantiator;
use crate::support::pager::{Pager, tlb_refill};
use crate::support::services::Service;
use crate::support::{SupportLayer, page_index};

const DEFAULT_STEP_BUDGET: u64 = 2_000_000;

/// How a run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Halt {
    /// Every process retired.
    Normal,
    /// Processes exist but none can ever run again.
    Deadlock,
    /// A kernel invariant failed.
    Abnormal(Abend),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("at most {UPROC_MAX} user processes are supported, got {0}")]
    TooManyUprocs(usize),
    #[error("image for asid {asid} spans {pages} pages, limit {limit}")]
    ImageTooLarge {
        asid: usize,
        pages: usize,
        limit: usize,
    },
    #[error("no terminal device {0}")]
    NoSuchTerminal(usize),
}

/// A user image as laid out on its backing flash device: block k holds
/// virtual page k, and page 0 opens with the header (magic, text size,
/// total size).
pub struct UserImage {
    pages: Vec<Vec<u8>>,
    text_size: u32,
}

impl UserImage {
    /// An image with `text_pages` read-only pages (at least one, for the
    /// header) and nothing else resident.
    pub fn new(text_pages: usize) -> Self {
        let n = text_pages.max(1);
        UserImage {
            pages: vec![vec![0; PAGE_SIZE]; n],
            text_size: (n * PAGE_SIZE) as u32,
        }
    }

    /// Preload page `idx` with `data` (zero-padded to a full page).
    pub fn with_page(mut self, idx: usize, data: &[u8]) -> Self {
        while self.pages.len() <= idx {
            self.pages.push(vec![0; PAGE_SIZE]);
        }
        let n = data.len().min(PAGE_SIZE);
        self.pages[idx][..n].copy_from_slice(&data[..n]);
        self
    }

    pub fn text_size(&self) -> u32 {
        self.text_size
    }
}

pub struct SystemBuilder {
    machine: Machine,
    programs: Vec<Box<dyn Program>>,
    images: Vec<UserImage>,
    terminal_inputs: Vec<(usize, Vec<u8>)>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        SystemBuilder {
            machine: Machine::new(),
            programs: Vec::new(),
            images: Vec::new(),
            terminal_inputs: Vec::new(),
        }
    }

    /// Register a user process: its body and the flash image backing it.
    /// Registration order assigns ASIDs starting at 1.
    pub fn uproc(mut self, program: Box<dyn Program>, image: UserImage) -> Self {
        self.programs.push(program);
        self.images.push(image);
        self
    }

    /// Queue input bytes on a terminal's receiver.
    pub fn terminal_input(mut self, dev: usize, bytes: &[u8]) -> Self {
        self.terminal_inputs.push((dev, bytes.to_vec()));
        self
    }

    pub fn build(mut self) -> Result<System, BuildError> {
        if self.programs.len() > UPROC_MAX {
            return Err(BuildError::TooManyUprocs(self.programs.len()));
        }
        for (dev, bytes) in &self.terminal_inputs {
            let t = self
                .machine
                .devices
                .terminal_mut(*dev)
                .ok_or(BuildError::NoSuchTerminal(*dev))?;
            t.push_input(bytes);
        }
        for (i, img) in self.images.iter().enumerate() {
            if img.pages.len() > PAGETBL_SIZE {
                return Err(BuildError::ImageTooLarge {
                    asid: i + 1,
                    pages: img.pages.len(),
                    limit: PAGETBL_SIZE,
                });
            }
            let flash = self
                .machine
                .devices
                .flash_mut(i)
                .expect("standard board carries eight flash devices");
            let store = flash.store_mut();
            for (b, page) in img.pages.iter().enumerate() {
                store[b * PAGE_SIZE..(b + 1) * PAGE_SIZE].copy_from_slice(page);
            }
            // Header overlays the first words of page 0.
            store[IMAGE_HDR_MAGIC_OFF..IMAGE_HDR_MAGIC_OFF + 4]
                .copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
            store[IMAGE_HDR_TEXT_SIZE_OFF..IMAGE_HDR_TEXT_SIZE_OFF + 4]
                .copy_from_slice(&img.text_size.to_le_bytes());
            let total = (img.pages.len() * PAGE_SIZE) as u32;
            store[IMAGE_HDR_TOTAL_SIZE_OFF..IMAGE_HDR_TOTAL_SIZE_OFF + 4]
                .copy_from_slice(&total.to_le_bytes());
        }

        let mut kernel = Kernel::new();
        let mut support = SupportLayer::new();
        support.registry = self.programs.into_iter().map(Some).collect();
        support.init(&mut kernel.sems);
        let mut machine = self.machine;
        kernel.boot(
            &mut machine,
            ProcessorState::kernel(INSTANTIATOR_ENTRY, NUCLEUS_STACK_TOP),
            Box::new(Instantiator::new()),
        );
        Ok(System {
            machine,
            kernel,
            support,
            steps: 0,
            step_budget: DEFAULT_STEP_BUDGET,
        })
    }
}

impl Default for SystemBuilder {
    fn default() -> Self {
        SystemBuilder::new()
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub struct System {
    pub machine: Machine,
    pub kernel: Kernel,
    pub support: SupportLayer,
    steps: u64,
    step_budget: u64,
}

impl System {
    /// A bare system whose first (and only initial) process is the given
    /// kernel-mode body. Used for exercising the nucleus without the
    /// support boot chain.
    pub fn with_init(body: Box<dyn Program>) -> Self {
        let mut kernel = Kernel::new();
        let mut support = SupportLayer::new();
        support.init(&mut kernel.sems);
        let mut machine = Machine::new();
        kernel.boot(
            &mut machine,
            ProcessorState::kernel(INSTANTIATOR_ENTRY, NUCLEUS_STACK_TOP),
            body,
        );
        System {
            machine,
            kernel,
            support,
            steps: 0,
            step_budget: DEFAULT_STEP_BUDGET,
        }
    }

    /// Cap on dispatch-loop iterations; a runaway system halts abnormally.
    pub fn set_step_budget(&mut self, steps: u64) {
        self.step_budget = steps;
    }

    pub fn now(&self) -> u64 {
        self.machine.now()
    }

    pub fn terminal_output(&self, dev: usize) -> &[u8] {
        self.machine
            .devices
            .terminal(dev)
            .map(|t| t.output())
            .unwrap_or(&[])
    }

    pub fn printer_output(&self, dev: usize) -> &[u8] {
        self.machine
            .devices
            .printer(dev)
            .map(|p| p.output())
            .unwrap_or(&[])
    }

    /// Run to halt.
    pub fn run(&mut self) -> Halt {
        let halt = loop {
            match self.step() {
                Ok(None) => {}
                Ok(Some(h)) => break h,
                Err(a) => {
                    error!("kernel abend: {a}");
                    break Halt::Abnormal(a);
                }
            }
        };
        info!("halt: {halt:?} at {}us after {} steps", self.now(), self.steps);
        halt
    }

    fn step(&mut self) -> Result<Option<Halt>, Abend> {
        self.steps += 1;
        if self.steps > self.step_budget {
            return Err(Abend::StepBudget);
        }

        let Some(pid) = self.kernel.current else {
            return self.idle_step();
        };

        // Interrupts preempt the next action. Handler contexts run in
        // kernel mode with interrupts on regardless of the saved state.
        let status = self.effective_status(pid);
        if let Some(cause) = self.machine.pending_cause(status) {
            let mut saved = self.kernel.pcbs.get(pid).state.clone();
            saved.cause = cause;
            self.machine.bios.saved = saved;
            self.kernel
                .on_exception(&mut self.machine, &mut self.support, None)?;
            return Ok(None);
        }

        match self.kernel.pcbs.get(pid).pending {
            Some(PendingWork::Compute(left)) => {
                self.advance_compute(pid, left);
                Ok(None)
            }
            Some(PendingWork::Access(acc)) => {
                let p = self.kernel.pcbs.get(pid);
                let fault_in_flight =
                    p.pf_task.is_some() || p.passup_pending[ExcSlot::PageFault.index()];
                if fault_in_flight {
                    // The access retries after the pager reloads the state.
                    self.run_runnable(pid)
                } else {
                    self.exec_access(pid, acc)?;
                    Ok(None)
                }
            }
            None => self.run_runnable(pid),
        }
    }

    fn idle_step(&mut self) -> Result<Option<Halt>, Abend> {
        match self.kernel.schedule(&mut self.machine) {
            Sched::Run(_) => Ok(None),
            Sched::HaltNormal => Ok(Some(Halt::Normal)),
            Sched::Deadlock => Ok(Some(Halt::Deadlock)),
            Sched::Wait => {
                let idle = Status::kernel_run();
                if self.machine.pending_cause(idle).is_none() {
                    let t = self
                        .machine
                        .clock
                        .next_deadline(false)
                        .ok_or(Abend::WaitWithoutEvents)?;
                    self.machine.advance_to(t);
                }
                if let Some(cause) = self.machine.pending_cause(idle) {
                    let mut saved = ProcessorState::kernel(EXCEPTION_ENTRY, NUCLEUS_STACK_TOP);
                    saved.cause = cause;
                    self.machine.bios.saved = saved;
                    self.kernel
                        .on_exception(&mut self.machine, &mut self.support, None)?;
                }
                Ok(None)
            }
        }
    }

    /// Status governing interrupt delivery: the exception-context status
    /// while a support handler runs, the process's own otherwise.
    fn effective_status(&self, pid: Pid) -> Status {
        let p = self.kernel.pcbs.get(pid);
        if p.pf_task.is_some()
            || p.gen_task.is_some()
            || p.passup_pending.iter().any(|&b| b)
        {
            Status::kernel_run()
        } else {
            p.state.status
        }
    }

    /// Burn compute time up to the next deadline that could interrupt.
    fn advance_compute(&mut self, pid: Pid, left: u64) {
        let status = self.kernel.pcbs.get(pid).state.status;
        let now = self.machine.now();
        let mut target = now + left;
        if let Some(d) = self.machine.clock.next_deadline(status.timer_on()) {
            target = target.min(d);
        }
        self.machine.advance_to(target);
        let consumed = target - now;
        self.kernel.pcbs.get_mut(pid).pending = if consumed >= left {
            None
        } else {
            Some(PendingWork::Compute(left - consumed))
        };
    }

    /// Retire a memory access, or raise the exception it deserves.
    fn exec_access(&mut self, pid: Pid, acc: Access) -> Result<(), Abend> {
        let is_store = matches!(acc.kind, AccessKind::StoreWord | AccessKind::StoreByte);
        let addr_err = if is_store {
            ExcCode::AddressStore
        } else {
            ExcCode::AddressLoad
        };
        let addr = acc.addr;

        if addr >= KUSEG_BASE {
            let vpn = addr >> 12;
            let Some(asid) = self.kernel.pcbs.get(pid).support else {
                return self.raise_trap(pid, addr_err, Some(vpn));
            };
            if page_index(vpn).is_none() {
                return self.raise_trap(pid, addr_err, Some(vpn));
            }
            let Some(slot) = self.machine.tlb.probe(vpn, asid) else {
                // Refill fast path; the access replays on the next step.
                let Some(sup) = self.support.get(asid) else {
                    return self.raise_trap(pid, addr_err, Some(vpn));
                };
                tlb_refill(&mut self.machine, sup, vpn);
                return Ok(());
            };
            let entry = self.machine.tlb.read(slot);
            if !entry.valid() {
                let code = if is_store {
                    ExcCode::TlbStoreInvalid
                } else {
                    ExcCode::TlbLoadInvalid
                };
                return self.raise_trap(pid, code, Some(vpn));
            }
            if is_store && !entry.dirty() {
                return self.raise_trap(pid, ExcCode::TlbModify, Some(vpn));
            }
            let pa = entry.frame_addr() | (addr & 0xFFF);
            self.finish_access(pid, acc, pa)
        } else {
            if self.kernel.pcbs.get(pid).state.status.user_mode() {
                return self.raise_trap(pid, addr_err, None);
            }
            self.finish_access(pid, acc, addr)
        }
    }

    fn finish_access(&mut self, pid: Pid, acc: Access, pa: u32) -> Result<(), Abend> {
        let outcome: Result<Option<u32>, ()> = match acc.kind {
            AccessKind::LoadWord => self.machine.ram.read_word(pa).map(Some).ok_or(()),
            AccessKind::LoadByte => self
                .machine
                .ram
                .read_byte(pa)
                .map(|b| Some(b as u32))
                .ok_or(()),
            AccessKind::StoreWord => self
                .machine
                .ram
                .write_word(pa, acc.val)
                .then_some(None)
                .ok_or(()),
            AccessKind::StoreByte => self
                .machine
                .ram
                .write_byte(pa, acc.val as u8)
                .then_some(None)
                .ok_or(()),
        };
        match outcome {
            Ok(loaded) => {
                let p = self.kernel.pcbs.get_mut(pid);
                p.pending = None;
                if loaded.is_some() {
                    p.load_result = loaded;
                }
                Ok(())
            }
            Err(()) => self.raise_trap(pid, ExcCode::BusErrorData, None),
        }
    }

    fn raise_trap(&mut self, pid: Pid, code: ExcCode, vpn: Option<u32>) -> Result<(), Abend> {
        let mut saved = self.kernel.pcbs.get(pid).state.clone();
        saved.cause = Cause::exception(code);
        if let Some(vpn) = vpn {
            saved.set_fault_vpn(vpn);
        }
        self.machine.bios.saved = saved;
        self.kernel
            .on_exception(&mut self.machine, &mut self.support, None)
    }

    fn raise_syscall(
        &mut self,
        pid: Pid,
        code: u32,
        a1: u32,
        a2: u32,
        a3: u32,
        from_task: bool,
        spawn: Option<SpawnArgs>,
    ) -> Result<(), Abend> {
        let mut saved = self.kernel.pcbs.get(pid).state.clone();
        if from_task {
            // A support handler traps from its exception context, which
            // runs in kernel mode whatever the interrupted state was.
            saved.status = Status::kernel_run();
        }
        saved.cause = Cause::exception(ExcCode::Syscall);
        saved.set_args(code, a1, a2, a3);
        self.machine.bios.saved = saved;
        self.kernel
            .on_exception(&mut self.machine, &mut self.support, spawn)
    }

    /// Lazily enter pass-ups whose handler has not started yet.
    fn activate_tasks(&mut self, pid: Pid) {
        let Some(asid) = self.kernel.pcbs.get(pid).support else {
            return;
        };
        let pf = ExcSlot::PageFault.index();
        let gn = ExcSlot::General.index();
        if self.kernel.pcbs.get(pid).passup_pending[pf]
            && self.kernel.pcbs.get(pid).pf_task.is_none()
        {
            if let Some(sup) = self.support.get(asid) {
                let saved = sup.saved[pf].clone();
                let p = self.kernel.pcbs.get_mut(pid);
                p.pf_task = Some(Pager::new(&saved));
                p.passup_pending[pf] = false;
            }
        }
        if self.kernel.pcbs.get(pid).passup_pending[gn]
            && self.kernel.pcbs.get(pid).gen_task.is_none()
        {
            if let Some(sup) = self.support.get(asid) {
                let saved = sup.saved[gn].clone();
                let p = self.kernel.pcbs.get_mut(pid);
                p.gen_task = Some(Service::from_saved(&saved));
                p.passup_pending[gn] = false;
            }
        }
    }

    /// Step the process's active runnable: pager, then general handler,
    /// then the body.
    fn run_runnable(&mut self, pid: Pid) -> Result<Option<Halt>, Abend> {
        self.activate_tasks(pid);
        let resume = {
            let p = self.kernel.pcbs.get_mut(pid);
            Resume {
                v0: p.state.v0(),
                loaded: p.load_result.take(),
            }
        };
        let asid = self.kernel.pcbs.get(pid).support.unwrap_or(0);

        let (action, from_task) = if self.kernel.pcbs.get(pid).pf_task.is_some() {
            let mut t = self.kernel.pcbs.get_mut(pid).pf_task.take().unwrap();
            let a = {
                let mut cx = Ctx {
                    machine: &mut self.machine,
                    support: &mut self.support,
                    resume,
                };
                t.step(&mut cx, asid)
            };
            self.kernel.pcbs.get_mut(pid).pf_task = Some(t);
            (a, true)
        } else if self.kernel.pcbs.get(pid).gen_task.is_some() {
            let mut t = self.kernel.pcbs.get_mut(pid).gen_task.take().unwrap();
            let a = {
                let mut cx = Ctx {
                    machine: &mut self.machine,
                    support: &mut self.support,
                    resume,
                };
                t.step(&mut cx, asid)
            };
            self.kernel.pcbs.get_mut(pid).gen_task = Some(t);
            (a, true)
        } else {
            let mut b = self
                .kernel
                .pcbs
                .get_mut(pid)
                .body
                .take()
                .ok_or(Abend::MissingBody(pid))?;
            let a = {
                let mut cx = Ctx {
                    machine: &mut self.machine,
                    support: &mut self.support,
                    resume,
                };
                b.next(&mut cx)
            };
            if !self.kernel.pcbs.is_free(pid) {
                self.kernel.pcbs.get_mut(pid).body = Some(b);
            }
            (a, false)
        };

        if cfg!(feature = "trace-actions") {
            log::trace!("pid {pid} action {action:?}");
        }
        self.apply_action(pid, action, from_task)?;
        Ok(None)
    }

    fn apply_action(&mut self, pid: Pid, action: Action, from_task: bool) -> Result<(), Abend> {
        // Privilege is a property of where the action came from: handler
        // contexts are kernel mode whatever the saved state says.
        let user = !from_task && self.kernel.pcbs.get(pid).state.status.user_mode();
        match action {
            Action::Compute(us) => {
                if us > 0 {
                    self.kernel.pcbs.get_mut(pid).pending = Some(PendingWork::Compute(us));
                }
                Ok(())
            }
            Action::Load(a) => self.queue_access(pid, AccessKind::LoadWord, a, 0),
            Action::LoadByte(a) => self.queue_access(pid, AccessKind::LoadByte, a, 0),
            Action::Store(a, v) => self.queue_access(pid, AccessKind::StoreWord, a, v),
            Action::StoreByte(a, v) => self.queue_access(pid, AccessKind::StoreByte, a, v as u32),
            Action::Syscall { code, a1, a2, a3 } => {
                self.raise_syscall(pid, code, a1, a2, a3, from_task, None)
            }
            Action::Spawn {
                state,
                support,
                body,
            } => {
                if user {
                    return self.raise_trap(pid, ExcCode::ReservedInstruction, None);
                }
                self.raise_syscall(
                    pid,
                    SYS_CREATE_PROCESS,
                    0,
                    0,
                    0,
                    from_task,
                    Some(SpawnArgs {
                        state,
                        support,
                        body,
                    }),
                )
            }
            Action::Resume(slot) => {
                if user {
                    return self.raise_trap(pid, ExcCode::ReservedInstruction, None);
                }
                let Some(asid) = self.kernel.pcbs.get(pid).support else {
                    return self.raise_trap(pid, ExcCode::ReservedInstruction, None);
                };
                match slot {
                    ExcSlot::PageFault => self.kernel.pcbs.get_mut(pid).pf_task = None,
                    ExcSlot::General => self.kernel.pcbs.get_mut(pid).gen_task = None,
                }
                let Some(sup) = self.support.get(asid) else {
                    return self.raise_trap(pid, ExcCode::ReservedInstruction, None);
                };
                self.kernel.pcbs.get_mut(pid).state = sup.saved[slot.index()].clone();
                Ok(())
            }
        }
    }

    fn queue_access(&mut self, pid: Pid, kind: AccessKind, addr: u32, val: u32) -> Result<(), Abend> {
        self.kernel.pcbs.get_mut(pid).pending =
            Some(PendingWork::Access(Access { kind, addr, val }));
        Ok(())
    }
}
