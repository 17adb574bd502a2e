/*!
The board: RAM, TLB, clock, device register file, and the BIOS data page.

`Machine` is the facade the kernel programs against. It owns no policy:
it moves time forward, applies device completions at their virtual instant,
and reports which interrupt lines are pending relative to a given status
word. Everything above (what an interrupt means, who wakes up) lives in the
nucleus.
*/

pub mod clock;
pub mod devices;
pub mod ram;
pub mod tlb;

pub use clock::Clock;
pub use devices::DeviceFile;
pub use ram::Ram;
pub use tlb::Tlb;

use log::trace;

use crate::consts::{FIRST_DEV_LINE, LAST_DEV_LINE, LINE_INTERVAL, LINE_PLT};
use crate::state::{Cause, ProcessorState, Status};

/// The pass-up vector: entry points and stack tops the nucleus installs at
/// boot for the two exception paths. The values are symbolic handler
/// addresses; dispatch above the machine boundary goes through typed calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassUpVec {
    pub tlb_refill_pc: u32,
    pub tlb_refill_sp: u32,
    pub exception_pc: u32,
    pub exception_sp: u32,
}

/// Fixed page where the hardware stores the trap-time processor state and
/// reads the pass-up vector.
#[derive(Default)]
pub struct BiosPage {
    pub saved: ProcessorState,
    pub passup: PassUpVec,
}

pub struct Machine {
    pub ram: Ram,
    pub tlb: Tlb,
    pub clock: Clock,
    pub devices: DeviceFile,
    pub bios: BiosPage,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            ram: Ram::new(),
            tlb: Tlb::new(),
            clock: Clock::new(),
            devices: DeviceFile::standard(),
            bios: BiosPage::default(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Write a device register; operations the device starts get their
    /// completion scheduled on the clock.
    pub fn dev_write(&mut self, line: usize, dev: usize, reg: usize, val: u32) {
        if let Some(s) = self.devices.write_reg(line, dev, reg, val) {
            trace!(
                "dev ({line},{dev}) reg {reg} <- {val:#x}, completes in {}us",
                s.latency
            );
            self.clock.schedule(s.latency, line, dev, s.sub);
        }
    }

    pub fn dev_read(&self, line: usize, dev: usize, reg: usize) -> u32 {
        self.devices.read_reg(line, dev, reg)
    }

    /// Advance virtual time, applying every device completion that falls
    /// due on the way.
    pub fn advance_to(&mut self, t: u64) {
        let due = self.clock.advance_to(t);
        for ev in due {
            trace!("completion line {} dev {} sub {}", ev.line, ev.dev, ev.sub);
            self.devices.complete(ev.line, ev.dev, ev.sub, &mut self.ram);
        }
    }

    /// Pending, unmasked interrupt lines relative to `status`, as a cause
    /// word, or None if nothing is deliverable.
    pub fn pending_cause(&self, status: Status) -> Option<Cause> {
        if !status.interrupts_on() {
            return None;
        }
        let mut lines = 0u32;
        if self.clock.plt_expired() && status.timer_on() && status.line_unmasked(LINE_PLT) {
            lines |= 1 << LINE_PLT;
        }
        if self.clock.interval_expired() && status.line_unmasked(LINE_INTERVAL) {
            lines |= 1 << LINE_INTERVAL;
        }
        for line in FIRST_DEV_LINE..=LAST_DEV_LINE {
            if self.devices.pending_bitmap(line) != 0 && status.line_unmasked(line) {
                lines |= 1 << line;
            }
        }
        if lines == 0 {
            None
        } else {
            Some(Cause::interrupt(lines))
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::*;

    #[test]
    fn completion_raises_pending_line() {
        let mut m = Machine::new();
        m.dev_write(LINE_FLASH, 0, REG_DATA0, frame_addr(40));
        m.dev_write(LINE_FLASH, 0, REG_COMMAND, (35 << 8) | FLASH_READBLK);
        assert_eq!(m.pending_cause(Status::kernel_run()), None);

        m.advance_to(m.clock.next_deadline(false).unwrap());
        let cause = m.pending_cause(Status::kernel_run()).unwrap();
        assert!(cause.pending_line(LINE_FLASH));

        // Masked status sees nothing.
        let masked = Status::IE_CURRENT | Status::TIMER_ENABLE;
        assert_eq!(m.pending_cause(masked), None);

        m.dev_write(LINE_FLASH, 0, REG_COMMAND, CMD_ACK);
        // Interval timer still looms, but the flash line is quiet again.
        if let Some(c) = m.pending_cause(Status::kernel_run()) {
            assert!(!c.pending_line(LINE_FLASH));
        }
    }

    #[test]
    fn plt_fires_only_with_timer_enabled() {
        let mut m = Machine::new();
        m.clock.set_plt(1_000);
        m.advance_to(1_000);
        assert!(
            m.pending_cause(Status::kernel_run())
                .unwrap()
                .pending_line(LINE_PLT)
        );
        let no_te = Status::IE_CURRENT | Status::IM_ALL;
        let c = m.pending_cause(no_te);
        assert!(c.is_none() || !c.unwrap().pending_line(LINE_PLT));
    }
}
