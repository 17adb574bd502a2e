/*!
Interrupt handling.

One interrupt is serviced per entry, highest priority first (lowest line
number): local timer, interval timer, then device lines 3..7 with the
lowest-numbered asserting device winning within a line. Anything still
pending re-raises before the dispatched process runs its next action, so
draining order follows line priority exactly.

Accounting happens on entry: the elapsed slice is charged to the current
process and the leftover quantum captured, so a process resumed afterwards
continues with what it had.
*/

use log::trace;

use crate::consts::*;
use crate::machine::Machine;
use crate::nucleus::{Abend, Kernel, Prio};
use crate::state::Cause;

impl Kernel {
    pub(crate) fn handle_interrupt(&mut self, m: &mut Machine, cause: Cause) -> Result<(), Abend> {
        let remaining = m.clock.plt_remaining();

        // Quantum expired: demote the running process.
        if cause.pending_line(LINE_PLT) && m.clock.plt_expired() {
            m.clock.set_plt(QUANTUM_US);
            if let Some(pid) = self.current.take() {
                trace!("quantum expired for pid {pid}");
                self.make_ready(pid, Prio::Low);
            }
            return Ok(());
        }

        // Pseudo-clock tick: release every sleeper on the tick semaphore.
        if cause.pending_line(LINE_INTERVAL) && m.clock.interval_expired() {
            m.clock.reload_interval();
            let addr = dev_sem_addr(PSEUDO_CLOCK_SEM);
            let mut woken = 0;
            while let Some(w) = self.asl.remove_blocked(&mut self.pcbs, addr) {
                self.soft_block_count -= 1;
                self.make_ready(w, Prio::High);
                woken += 1;
            }
            self.sems.set(addr, 0);
            trace!("pseudo-clock tick at {}us, {woken} woken", m.now());
            if self.current.is_some() {
                self.resume_current(m, remaining);
            }
            return Ok(());
        }

        // Device lines, in priority order.
        for line in FIRST_DEV_LINE..=LAST_DEV_LINE {
            if !cause.pending_line(line) {
                continue;
            }
            let bitmap = m.devices.pending_bitmap(line);
            if bitmap == 0 {
                continue;
            }
            let dev = bitmap.trailing_zeros() as usize;
            let (status, idx) = self.acknowledge(m, line, dev);
            let addr = dev_sem_addr(idx);
            self.set_dev_status(idx, status);
            if self.sems.inc(addr) <= 0 {
                if let Some(w) = self.asl.remove_blocked(&mut self.pcbs, addr) {
                    self.pcbs.get_mut(w).state.set_v0(status);
                    self.soft_block_count -= 1;
                    self.make_ready(w, Prio::High);
                    trace!("device ({line},{dev}) woke pid {w}, status {status:#x}");
                }
            }
            if self.current.is_some() {
                self.resume_current(m, remaining);
            }
            return Ok(());
        }

        Err(Abend::PhantomInterrupt)
    }

    /// Read the completion status and acknowledge the device. For terminals
    /// the transmitter is checked first: if it has not completed, the
    /// interrupt belongs to the receiver, whose semaphore lives in the
    /// second bank.
    fn acknowledge(&mut self, m: &mut Machine, line: usize, dev: usize) -> (u32, usize) {
        if line == LINE_TERMINAL {
            let transm = m.dev_read(line, dev, REG_TRANSM_STATUS);
            if transm & 0xFF == STAT_CHAR_OK {
                m.dev_write(line, dev, REG_TRANSM_COMMAND, CMD_ACK);
                (transm, dev_sem_index(line, dev, false))
            } else {
                let recv = m.dev_read(line, dev, REG_RECV_STATUS);
                m.dev_write(line, dev, REG_RECV_COMMAND, CMD_ACK);
                (recv, dev_sem_index(line, dev, true))
            }
        } else {
            let status = m.dev_read(line, dev, REG_STATUS);
            m.dev_write(line, dev, REG_COMMAND, CMD_ACK);
            (status, dev_sem_index(line, dev, false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nucleus::{Kernel, Location, Pid};
    use crate::state::Status;

    fn blocked_waiter(k: &mut Kernel, sem: u32, soft: bool) -> Pid {
        let pid = k.pcbs.alloc().unwrap();
        k.process_count += 1;
        k.sems.dec(sem);
        k.asl.insert_blocked(&mut k.pcbs, sem, pid);
        if soft {
            k.soft_block_count += 1;
        }
        pid
    }

    fn deliver(k: &mut Kernel, m: &mut Machine) {
        let cause = m
            .pending_cause(Status::kernel_run())
            .expect("an interrupt should be pending");
        k.handle_interrupt(m, cause).unwrap();
    }

    #[test]
    fn device_completion_wakes_the_waiter_with_its_status() {
        let mut k = Kernel::new();
        let mut m = Machine::new();
        let idx = dev_sem_index(LINE_FLASH, 2, false);
        let waiter = blocked_waiter(&mut k, dev_sem_addr(idx), true);

        m.dev_write(LINE_FLASH, 2, REG_DATA0, frame_addr(40));
        m.dev_write(LINE_FLASH, 2, REG_COMMAND, (40 << 8) | FLASH_READBLK);
        m.advance_to(m.clock.next_deadline(false).unwrap());
        deliver(&mut k, &mut m);

        assert_eq!(k.pcbs.get(waiter).location, Location::Ready(Prio::High));
        assert_eq!(k.pcbs.get(waiter).state.v0(), STAT_READY);
        assert_eq!(k.soft_block_count, 0);
        // Acknowledged: the line is quiet again.
        assert_eq!(m.devices.pending_bitmap(LINE_FLASH), 0);
    }

    #[test]
    fn completion_with_no_waiter_latches_the_status() {
        let mut k = Kernel::new();
        let mut m = Machine::new();
        m.dev_write(LINE_PRINTER, 1, REG_DATA0, b'!' as u32);
        m.dev_write(LINE_PRINTER, 1, REG_COMMAND, PRINTER_PRINTCHR);
        m.advance_to(m.clock.next_deadline(false).unwrap());
        deliver(&mut k, &mut m);

        let idx = dev_sem_index(LINE_PRINTER, 1, false);
        assert_eq!(k.sems.get(dev_sem_addr(idx)), 1);
        assert_eq!(k.dev_status(idx), STAT_READY);
    }

    #[test]
    fn terminal_transmitter_outranks_its_receiver() {
        let mut k = Kernel::new();
        let mut m = Machine::new();
        let tx = blocked_waiter(
            &mut k,
            dev_sem_addr(dev_sem_index(LINE_TERMINAL, 0, false)),
            true,
        );
        let rx = blocked_waiter(
            &mut k,
            dev_sem_addr(dev_sem_index(LINE_TERMINAL, 0, true)),
            true,
        );

        m.devices.terminal_mut(0).unwrap().push_input(b"z");
        m.dev_write(LINE_TERMINAL, 0, REG_RECV_COMMAND, TERM_RECEIVE);
        m.dev_write(
            LINE_TERMINAL,
            0,
            REG_TRANSM_COMMAND,
            ((b'q' as u32) << 8) | TERM_TRANSMIT,
        );
        m.advance_to(m.clock.next_deadline(false).unwrap());

        // First delivery acknowledges the transmitter, second the receiver.
        deliver(&mut k, &mut m);
        assert_eq!(k.pcbs.get(tx).location, Location::Ready(Prio::High));
        assert_eq!(k.pcbs.get(tx).state.v0() >> 8, b'q' as u32);
        assert!(matches!(k.pcbs.get(rx).location, Location::Blocked(_)));

        deliver(&mut k, &mut m);
        assert_eq!(k.pcbs.get(rx).location, Location::Ready(Prio::High));
        assert_eq!(k.pcbs.get(rx).state.v0() >> 8, b'z' as u32);
        assert_eq!(k.soft_block_count, 0);
    }

    #[test]
    fn pseudo_clock_tick_drains_every_sleeper() {
        let mut k = Kernel::new();
        let mut m = Machine::new();
        let tick = dev_sem_addr(PSEUDO_CLOCK_SEM);
        let a = blocked_waiter(&mut k, tick, true);
        let b = blocked_waiter(&mut k, tick, true);

        m.advance_to(TICK_US);
        deliver(&mut k, &mut m);

        assert_eq!(k.pcbs.get(a).location, Location::Ready(Prio::High));
        assert_eq!(k.pcbs.get(b).location, Location::Ready(Prio::High));
        assert_eq!(k.soft_block_count, 0);
        assert_eq!(k.sems.get(tick), 0);
        assert!(!m.clock.interval_expired());
    }
}
