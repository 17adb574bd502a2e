/*!
Dispatcher decisions.

Strict high-over-low ready queue draining. A dispatched process gets a full
quantum on its local timer; a process resumed after a non-quantum interrupt
keeps whatever was left (that path re-arms inline in the interrupt handler
and never comes through here).

With nothing ready the decision tree is exactly the accounting invariants:
processes exist and some are soft-blocked → idle until an interrupt;
processes exist but none can ever run → deadlock; no processes → done.
*/

use log::{debug, info};

use crate::consts::QUANTUM_US;
use crate::machine::Machine;
use crate::nucleus::pcb::Location;
use crate::nucleus::{Kernel, Pid};

#[derive(Debug, PartialEq, Eq)]
pub enum Sched {
    /// A process was dispatched into the current slot.
    Run(Pid),
    /// Ready queues empty, sleepers exist: enter the wait state.
    Wait,
    /// Ready queues empty, no sleepers, processes exist: deadlock.
    Deadlock,
    /// Nothing left to run, ever.
    HaltNormal,
}

impl Kernel {
    pub fn schedule(&mut self, m: &mut Machine) -> Sched {
        debug_assert!(self.current.is_none());
        let next = self
            .ready_high
            .remove_head(&mut self.pcbs)
            .or_else(|| self.ready_low.remove_head(&mut self.pcbs));

        if let Some(pid) = next {
            self.pcbs.get_mut(pid).location = Location::Current;
            self.current = Some(pid);
            m.clock.set_plt(QUANTUM_US);
            self.start_slice = m.now();
            debug!("dispatch pid {pid} at {}us", m.now());
            return Sched::Run(pid);
        }

        if self.process_count == 0 {
            info!("all processes retired, halting");
            return Sched::HaltNormal;
        }
        if self.soft_block_count > 0 {
            // Quantum timer off while idling; only device and interval
            // interrupts can end the wait.
            m.clock.clear_plt();
            return Sched::Wait;
        }
        info!(
            "deadlock: {} processes, nothing ready, nothing waiting on a device",
            self.process_count
        );
        Sched::Deadlock
    }

    /// Re-arm the local timer for a process resumed in place after an
    /// interrupt, with the quantum it had left.
    pub(crate) fn resume_current(&mut self, m: &mut Machine, remaining: u64) {
        debug_assert!(self.current.is_some());
        m.clock.set_plt(remaining);
        self.start_slice = m.now();
    }
}
