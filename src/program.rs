/*!
Process bodies: the action stream a process feeds the machine.

The machine does not interpret instructions. Everything that "executes"
(user processes, the instantiator, the delay daemon, and the support-layer
service handlers) implements [`Program`]: a resumable generator of
[`Action`]s. One action corresponds to a stretch of machine-level execution
that ends either by completing or by trapping:

- `Compute(us)` burns virtual CPU time (and is where quantum/interval/device
  interrupts can preempt; the machine tracks partial progress so a preempted
  computation continues without re-consulting the program).
- `Load`/`Store` (word) and `LoadByte`/`StoreByte` access memory. User-segment
  addresses go through the TLB and can raise the full page-fault path before
  the access finally retires.
- `Syscall` raises the trap the nucleus dispatches on. The return value
  arrives in `Resume::v0` when the program is next stepped.
- `Spawn` is the create-process service with the child's body attached
  (states are not addressable here, so the body rides along instead of a
  state pointer). Kernel mode only; from user mode it is a privilege trap.
- `Resume(slot)` reloads a saved exception state, the tail of every
  support-layer handler. Kernel mode only.

Suspension works by construction: a program is only asked for its next
action after the previous one fully retired, so every blocking point in a
handler state machine is a syscall boundary.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::consts::{SYS_TERMINATE, SYS_TERMINATE_PROCESS};
use crate::machine::Machine;
use crate::state::ProcessorState;
use crate::support::SupportLayer;

/// The two saved-exception-state slots of a support structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcSlot {
    PageFault,
    General,
}

impl ExcSlot {
    pub fn index(self) -> usize {
        match self {
            ExcSlot::PageFault => 0,
            ExcSlot::General => 1,
        }
    }
}

/// One unit of process execution.
pub enum Action {
    Compute(u64),
    Load(u32),
    LoadByte(u32),
    Store(u32, u32),
    StoreByte(u32, u8),
    Syscall { code: u32, a1: u32, a2: u32, a3: u32 },
    Spawn {
        state: ProcessorState,
        support: Option<usize>,
        body: Box<dyn Program>,
    },
    Resume(ExcSlot),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Compute(us) => write!(f, "Compute({us})"),
            Action::Load(a) => write!(f, "Load({a:#010x})"),
            Action::LoadByte(a) => write!(f, "LoadByte({a:#010x})"),
            Action::Store(a, v) => write!(f, "Store({a:#010x}, {v:#x})"),
            Action::StoreByte(a, v) => write!(f, "StoreByte({a:#010x}, {v:#04x})"),
            Action::Syscall { code, a1, a2, a3 } => {
                write!(f, "Syscall({code}, {a1:#x}, {a2:#x}, {a3:#x})")
            }
            Action::Spawn { support, .. } => write!(f, "Spawn(support: {support:?})"),
            Action::Resume(slot) => write!(f, "Resume({slot:?})"),
        }
    }
}

/// Values carried back into a program when it is stepped again.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resume {
    /// v0 of the process's state: the last syscall's return value.
    pub v0: u32,
    /// Result of the last completed load, if the previous action was one.
    pub loaded: Option<u32>,
}

/// Everything a (kernel-resident) program may touch while producing its next
/// action. User-level programs only read `resume`.
pub struct Ctx<'a> {
    pub machine: &'a mut Machine,
    pub support: &'a mut SupportLayer,
    pub resume: Resume,
}

pub trait Program {
    fn next(&mut self, cx: &mut Ctx<'_>) -> Action;
}

// ---------------------------------------------------------------------------
// Script: a canned program for tests and demos
// ---------------------------------------------------------------------------

/// One scripted operation. Mirrors `Action` with owned spawn bodies.
pub enum Op {
    Compute(u64),
    Syscall(u32, u32, u32, u32),
    Load(u32),
    LoadByte(u32),
    Store(u32, u32),
    StoreByte(u32, u8),
    Spawn {
        state: ProcessorState,
        body: Box<dyn Program>,
    },
}

/// Shared log of syscall return values / loaded words, in program order.
/// Lets a test observe what a process saw after the system has halted.
pub type ReturnLog = Rc<RefCell<Vec<u32>>>;

/// A linear program. When the ops run out it terminates itself: a kernel
/// script through the nucleus terminate, a user script through the support
/// layer's terminate service.
pub struct Script {
    ops: VecDeque<Op>,
    returns: ReturnLog,
    record_next: Record,
    exit_code: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Record {
    Nothing,
    V0,
    Loaded,
}

impl Script {
    /// Kernel-mode script: falls off the end into nucleus terminate (SYS2).
    pub fn kernel(ops: Vec<Op>) -> Self {
        Script {
            ops: ops.into(),
            returns: Rc::new(RefCell::new(Vec::new())),
            record_next: Record::Nothing,
            exit_code: SYS_TERMINATE_PROCESS,
        }
    }

    /// User-mode script: falls off the end into support terminate (SYS9).
    pub fn user(ops: Vec<Op>) -> Self {
        Script {
            exit_code: SYS_TERMINATE,
            ..Script::kernel(ops)
        }
    }

    /// Handle to the return-value log; clone before boxing the script.
    pub fn returns(&self) -> ReturnLog {
        Rc::clone(&self.returns)
    }
}

impl Program for Script {
    fn next(&mut self, cx: &mut Ctx<'_>) -> Action {
        match self.record_next {
            Record::V0 => self.returns.borrow_mut().push(cx.resume.v0),
            Record::Loaded => {
                if let Some(v) = cx.resume.loaded {
                    self.returns.borrow_mut().push(v);
                }
            }
            Record::Nothing => {}
        }
        self.record_next = Record::Nothing;

        match self.ops.pop_front() {
            Some(Op::Compute(us)) => Action::Compute(us),
            Some(Op::Syscall(code, a1, a2, a3)) => {
                self.record_next = Record::V0;
                Action::Syscall { code, a1, a2, a3 }
            }
            Some(Op::Load(a)) => {
                self.record_next = Record::Loaded;
                Action::Load(a)
            }
            Some(Op::LoadByte(a)) => {
                self.record_next = Record::Loaded;
                Action::LoadByte(a)
            }
            Some(Op::Store(a, v)) => Action::Store(a, v),
            Some(Op::StoreByte(a, v)) => Action::StoreByte(a, v),
            Some(Op::Spawn { state, body }) => {
                // The create service reports success in v0 like any syscall.
                self.record_next = Record::V0;
                Action::Spawn {
                    state,
                    support: None,
                    body,
                }
            }
            None => Action::Syscall {
                code: self.exit_code,
                a1: 0,
                a2: 0,
                a3: 0,
            },
        }
    }
}
