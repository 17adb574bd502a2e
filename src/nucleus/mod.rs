/*!
The nucleus: the lowest kernel layer.

One `Kernel` value owns every piece of global scheduling state (the PCB
pool, the Active Semaphore List and counter table, the two ready queues, the
current-process slot, and the process/soft-block accounting) and is
threaded through the exception paths by the top-level trampoline. Nothing
here is re-entrant and nothing here blocks: every function runs to
completion with the machine conceptually masked.

Layout:
- `pcb`        PCB arena, queues, process tree
- `asl`        Active Semaphore List + semaphore counters
- `sched`      dispatcher decisions (run / wait / halt / deadlock)
- `exceptions` exception decode, pass-up-or-die, termination
- `interrupts` interrupt classification, device acknowledge, wakeups
- `syscalls`   services 1..8
*/

pub mod asl;
pub mod exceptions;
pub mod interrupts;
pub mod pcb;
pub mod sched;
pub mod syscalls;

pub use pcb::{Location, Pcb, PcbPool, Pid, Prio, ProcQueue};

use thiserror::Error;

use crate::consts::*;
use crate::machine::Machine;
use crate::program::Program;
use crate::state::ProcessorState;
use asl::{Asl, SemSpace};

/// Unrecoverable kernel invariant failures. The machine halts abnormally;
/// the kernel never attempts to recover from these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Abend {
    #[error("unknown exception code in cause {0:#x}")]
    UnknownException(u32),
    #[error("interrupt raised with no pending line")]
    PhantomInterrupt,
    #[error("trap taken with no current process")]
    NoCurrentProcess,
    #[error("wait state entered with nothing scheduled to happen")]
    WaitWithoutEvents,
    #[error("dispatch step budget exceeded (runaway system)")]
    StepBudget,
    #[error("process body missing for pid {0}")]
    MissingBody(Pid),
}

/// Payload for the create-process service: the child's initial state with
/// its body attached (no raw state pointers cross this boundary).
pub struct SpawnArgs {
    pub state: ProcessorState,
    pub support: Option<usize>,
    pub body: Box<dyn Program>,
}

pub struct Kernel {
    pub pcbs: PcbPool,
    pub asl: Asl,
    pub sems: SemSpace,
    pub ready_high: ProcQueue,
    pub ready_low: ProcQueue,
    pub current: Option<Pid>,
    pub process_count: usize,
    pub soft_block_count: usize,
    /// Latched status of the last completed operation per device semaphore,
    /// delivered by WaitIO when the completion beat the waiter.
    dev_status: [u32; DEV_SEM_COUNT],
    /// TOD at the start of the current execution slice.
    start_slice: u64,
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            pcbs: PcbPool::new(MAX_PROC),
            asl: Asl::new(),
            sems: SemSpace::new(),
            ready_high: ProcQueue::new(),
            ready_low: ProcQueue::new(),
            current: None,
            process_count: 0,
            soft_block_count: 0,
            dev_status: [0; DEV_SEM_COUNT],
            start_slice: 0,
        }
    }

    /// Nucleus initialization: install the pass-up vector, arm the interval
    /// timer, define the device semaphores, and enqueue the first process.
    pub fn boot(&mut self, m: &mut Machine, state: ProcessorState, body: Box<dyn Program>) {
        m.bios.passup = crate::machine::PassUpVec {
            tlb_refill_pc: TLB_REFILL_ENTRY,
            tlb_refill_sp: NUCLEUS_STACK_TOP,
            exception_pc: EXCEPTION_ENTRY,
            exception_sp: NUCLEUS_STACK_TOP,
        };
        m.clock.reload_interval();
        for i in 0..DEV_SEM_COUNT {
            self.sems.define(dev_sem_addr(i), 0);
        }
        let pid = self
            .pcbs
            .alloc()
            .expect("boot: empty machine cannot exhaust the PCB pool");
        let p = self.pcbs.get_mut(pid);
        p.state = state;
        p.body = Some(body);
        p.location = Location::Ready(Prio::High);
        self.ready_high.insert(&mut self.pcbs, pid);
        self.process_count = 1;
        log::info!("nucleus up: first process is pid {pid}");
    }

    /// Charge the elapsed slice to the current process and restart the
    /// accounting clock. Called on every trap entry.
    pub(crate) fn charge_time(&mut self, m: &Machine) {
        if let Some(pid) = self.current {
            let now = m.now();
            self.pcbs.get_mut(pid).cpu_time += now.saturating_sub(self.start_slice);
            self.start_slice = now;
        }
    }

    /// Put a process back on a ready queue.
    pub(crate) fn make_ready(&mut self, pid: Pid, prio: Prio) {
        self.pcbs.get_mut(pid).location = Location::Ready(prio);
        match prio {
            Prio::High => self.ready_high.insert(&mut self.pcbs, pid),
            Prio::Low => self.ready_low.insert(&mut self.pcbs, pid),
        }
    }

    /// Block the current process on `sem_addr` and vacate the current slot.
    pub(crate) fn block_current(&mut self, sem_addr: u32) {
        let pid = self.current.take().expect("block with no current process");
        self.asl.insert_blocked(&mut self.pcbs, sem_addr, pid);
    }

    /// True for the device and pseudo-clock semaphores, whose sleepers are
    /// counted in `soft_block_count`.
    pub(crate) fn is_device_sem(addr: u32) -> bool {
        (DEV_SEM_BASE..dev_sem_addr(DEV_SEM_COUNT)).contains(&addr)
    }

    pub(crate) fn set_dev_status(&mut self, index: usize, status: u32) {
        self.dev_status[index] = status;
    }

    pub(crate) fn dev_status(&self, index: usize) -> u32 {
        self.dev_status[index]
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}
