#![doc = r#"
minos library crate.

An educational multi-process kernel for a virtualized MIPS-class machine,
together with the machine model it runs on. The board (RAM, TLB, device
register file, timers) is simulated over a deterministic virtual clock;
process bodies are streams of actions (compute, memory access, syscall)
rather than interpreted instructions, which keeps the kernel's exception,
scheduling, paging, and device semantics fully observable and testable.

Modules:
- consts:  machine layout, device codes, latencies, tuning constants
- state:   saved processor state, status/cause fields
- program: the Action stream, the Program trait, canned Scripts
- machine: the board: RAM, TLB, clock, devices, BIOS data page
- nucleus: PCB pool and queues, ASL, scheduler, exceptions, interrupts,
           syscalls 1..8
- support: pager and TLB refill, syscalls 9..18, DMA block I/O, the delay
           facility, the instantiator
- system:  the trampoline binding it all together, plus the builder

In tests, shared machine/script builders live under `crate::test_utils`.
"#]

pub mod consts;
pub mod machine;
pub mod nucleus;
pub mod program;
pub mod state;
pub mod support;
pub mod system;

// Re-export the types embedders touch most.
pub use program::{Op, Program, Script};
pub use system::{Halt, System, SystemBuilder, UserImage};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;

// Scenario-level suites exercising whole boots.
#[cfg(test)]
mod scenarios;
