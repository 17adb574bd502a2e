/*!
Virtual time: TOD clock, processor-local timer, interval timer, and the
device completion queue.

Order of operations per advance: time only moves forward via `advance_to`,
and callers advance exactly to the next relevant deadline, so completions
are applied at their precise virtual instant. Ties are broken by schedule
order (seq), keeping multi-device completions deterministic.
*/

use crate::consts::TICK_US;

/// A device operation completing at `when`. `sub` distinguishes the two
/// terminal sub-devices (0 = receiver / whole device, 1 = transmitter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub when: u64,
    pub line: usize,
    pub dev: usize,
    pub sub: usize,
    seq: u64,
}

pub struct Clock {
    tod: u64,
    plt_deadline: Option<u64>,
    interval_deadline: u64,
    events: Vec<Event>,
    seq: u64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            tod: 0,
            plt_deadline: None,
            interval_deadline: TICK_US,
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn now(&self) -> u64 {
        self.tod
    }

    // ------------------------------------------------------------------
    // Processor-local timer (quantum)
    // ------------------------------------------------------------------

    pub fn set_plt(&mut self, us: u64) {
        self.plt_deadline = Some(self.tod + us);
    }

    pub fn clear_plt(&mut self) {
        self.plt_deadline = None;
    }

    /// Microseconds left on the local timer; 0 once expired or disarmed.
    pub fn plt_remaining(&self) -> u64 {
        self.plt_deadline
            .map(|d| d.saturating_sub(self.tod))
            .unwrap_or(0)
    }

    pub fn plt_expired(&self) -> bool {
        matches!(self.plt_deadline, Some(d) if d <= self.tod)
    }

    // ------------------------------------------------------------------
    // Interval timer (pseudo-clock)
    // ------------------------------------------------------------------

    pub fn interval_expired(&self) -> bool {
        self.interval_deadline <= self.tod
    }

    /// Reload the interval timer with a full tick.
    pub fn reload_interval(&mut self) {
        self.interval_deadline = self.tod + TICK_US;
    }

    // ------------------------------------------------------------------
    // Device completions
    // ------------------------------------------------------------------

    pub fn schedule(&mut self, latency: u64, line: usize, dev: usize, sub: usize) {
        let ev = Event {
            when: self.tod + latency.max(1),
            line,
            dev,
            sub,
            seq: self.seq,
        };
        self.seq += 1;
        let pos = self
            .events
            .iter()
            .position(|e| (e.when, e.seq) > (ev.when, ev.seq))
            .unwrap_or(self.events.len());
        self.events.insert(pos, ev);
    }

    /// Drop any in-flight completion for a device (device reset).
    pub fn cancel(&mut self, line: usize, dev: usize) {
        self.events.retain(|e| !(e.line == line && e.dev == dev));
    }

    /// Earliest *future* deadline among the interval timer, pending
    /// completions, and (when `with_plt`) the local timer. Deadlines
    /// already reached are someone's pending interrupt, not a reason to
    /// move time.
    pub fn next_deadline(&self, with_plt: bool) -> Option<u64> {
        let mut t: Option<u64> = None;
        let mut consider = |d: u64| {
            if d > self.tod {
                t = Some(t.map_or(d, |cur: u64| cur.min(d)));
            }
        };
        consider(self.interval_deadline);
        if let Some(ev) = self.events.first() {
            consider(ev.when);
        }
        if with_plt {
            if let Some(d) = self.plt_deadline {
                consider(d);
            }
        }
        t
    }

    /// Move time forward (never backward) and hand back the completions now
    /// due, in schedule order.
    pub fn advance_to(&mut self, t: u64) -> Vec<Event> {
        debug_assert!(t >= self.tod);
        self.tod = self.tod.max(t);
        let due = self
            .events
            .iter()
            .take_while(|e| e.when <= self.tod)
            .count();
        self.events.drain(..due).collect()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plt_remaining_counts_down() {
        let mut c = Clock::new();
        c.set_plt(5_000);
        assert_eq!(c.plt_remaining(), 5_000);
        c.advance_to(3_000);
        assert_eq!(c.plt_remaining(), 2_000);
        assert!(!c.plt_expired());
        c.advance_to(5_000);
        assert!(c.plt_expired());
    }

    #[test]
    fn events_pop_in_time_then_schedule_order() {
        let mut c = Clock::new();
        c.schedule(100, 4, 0, 0);
        c.schedule(50, 3, 1, 0);
        c.schedule(100, 7, 2, 1);
        assert_eq!(c.next_deadline(false), Some(50));
        let due = c.advance_to(100);
        let order: Vec<_> = due.iter().map(|e| (e.line, e.dev)).collect();
        assert_eq!(order, vec![(3, 1), (4, 0), (7, 2)]);
    }

    #[test]
    fn interval_timer_reload() {
        let mut c = Clock::new();
        assert_eq!(c.next_deadline(false), Some(TICK_US));
        c.advance_to(TICK_US);
        assert!(c.interval_expired());
        // An expired interval timer is a pending interrupt, not a deadline.
        assert_eq!(c.next_deadline(false), None);
        c.reload_interval();
        assert!(!c.interval_expired());
        assert_eq!(c.next_deadline(false), Some(2 * TICK_US));
    }
}
