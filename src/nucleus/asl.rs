/*!
Active Semaphore List and the semaphore counter table.

Semaphores are named by address (user code may pass any u32), so both
structures key on the address:

- `SemSpace` holds the integer counters. A counter springs into existence
  at 0 the first time it is touched; binary mutexes get preset to 1 at
  support-layer boot.
- `Asl` holds a descriptor per semaphore that currently has blocked
  processes: an ordered map from address to a FIFO queue of PCBs. A
  descriptor exists exactly as long as its queue is non-empty.

The ASL maintains the `Location::Blocked` tag of every PCB it holds, which
is what makes the containment invariants checkable: a PCB points at a
semaphore iff it sits in that semaphore's queue.
*/

use std::collections::BTreeMap;

use crate::nucleus::pcb::{Location, PcbPool, Pid, ProcQueue};

#[derive(Default)]
pub struct SemSpace {
    counters: BTreeMap<u32, i32>,
}

impl SemSpace {
    pub fn new() -> Self {
        SemSpace::default()
    }

    /// Preset a counter (mutexes start at 1).
    pub fn define(&mut self, addr: u32, value: i32) {
        self.counters.insert(addr, value);
    }

    pub fn get(&self, addr: u32) -> i32 {
        self.counters.get(&addr).copied().unwrap_or(0)
    }

    pub fn set(&mut self, addr: u32, value: i32) {
        self.counters.insert(addr, value);
    }

    /// P side: decrement and return the new value.
    pub fn dec(&mut self, addr: u32) -> i32 {
        let c = self.counters.entry(addr).or_insert(0);
        *c -= 1;
        *c
    }

    /// V side: increment and return the new value.
    pub fn inc(&mut self, addr: u32) -> i32 {
        let c = self.counters.entry(addr).or_insert(0);
        *c += 1;
        *c
    }
}

#[derive(Default)]
pub struct Asl {
    descriptors: BTreeMap<u32, ProcQueue>,
}

impl Asl {
    pub fn new() -> Self {
        Asl::default()
    }

    /// Append `pid` to the blocked queue for `sem_addr`, creating the
    /// descriptor if this is the first sleeper.
    pub fn insert_blocked(&mut self, pool: &mut PcbPool, sem_addr: u32, pid: Pid) {
        let q = self.descriptors.entry(sem_addr).or_default();
        q.insert(pool, pid);
        pool.get_mut(pid).location = Location::Blocked(sem_addr);
    }

    /// Wake the head sleeper of `sem_addr`, retiring the descriptor when the
    /// queue drains. The woken PCB's location is the caller's to set.
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, sem_addr: u32) -> Option<Pid> {
        let q = self.descriptors.get_mut(&sem_addr)?;
        let pid = q.remove_head(pool)?;
        if q.is_empty() {
            self.descriptors.remove(&sem_addr);
        }
        Some(pid)
    }

    /// Yank a specific PCB out of whatever queue it sleeps on (termination
    /// path). Returns the pid if it was blocked at all.
    pub fn out_blocked(&mut self, pool: &mut PcbPool, pid: Pid) -> Option<Pid> {
        let Location::Blocked(addr) = pool.get(pid).location else {
            return None;
        };
        let q = self.descriptors.get_mut(&addr)?;
        if !q.remove(pool, pid) {
            return None;
        }
        if q.is_empty() {
            self.descriptors.remove(&addr);
        }
        Some(pid)
    }

    pub fn head_blocked(&self, pool: &PcbPool, sem_addr: u32) -> Option<Pid> {
        self.descriptors.get(&sem_addr)?.head(pool)
    }

    pub fn has_sleepers(&self, sem_addr: u32) -> bool {
        self.descriptors.contains_key(&sem_addr)
    }

    pub fn queue_len(&self, sem_addr: u32) -> usize {
        self.descriptors.get(&sem_addr).map_or(0, |q| q.len())
    }

    /// Addresses with live descriptors, in sorted order.
    pub fn active(&self) -> Vec<u32> {
        self.descriptors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAX_PROC;
    use crate::nucleus::pcb::PcbPool;

    fn pool() -> PcbPool {
        PcbPool::new(MAX_PROC)
    }

    #[test]
    fn descriptor_lifecycle_tracks_queue() {
        let mut p = pool();
        let mut asl = Asl::new();
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();

        asl.insert_blocked(&mut p, 0x100, a);
        asl.insert_blocked(&mut p, 0x100, b);
        assert!(asl.has_sleepers(0x100));
        assert_eq!(asl.head_blocked(&p, 0x100), Some(a));
        assert_eq!(p.get(a).blocked_on(), Some(0x100));

        assert_eq!(asl.remove_blocked(&mut p, 0x100), Some(a));
        assert_eq!(asl.remove_blocked(&mut p, 0x100), Some(b));
        assert!(!asl.has_sleepers(0x100));
        assert_eq!(asl.remove_blocked(&mut p, 0x100), None);
    }

    #[test]
    fn out_blocked_removes_from_the_middle() {
        let mut p = pool();
        let mut asl = Asl::new();
        let pids: Vec<_> = (0..3).map(|_| p.alloc().unwrap()).collect();
        for &pid in &pids {
            asl.insert_blocked(&mut p, 0x200, pid);
        }
        assert_eq!(asl.out_blocked(&mut p, pids[1]), Some(pids[1]));
        assert_eq!(asl.queue_len(0x200), 2);
        assert_eq!(asl.remove_blocked(&mut p, 0x200), Some(pids[0]));
        assert_eq!(asl.remove_blocked(&mut p, 0x200), Some(pids[2]));
        assert!(!asl.has_sleepers(0x200));
    }

    #[test]
    fn out_blocked_on_unblocked_pcb_is_none() {
        let mut p = pool();
        let mut asl = Asl::new();
        let a = p.alloc().unwrap();
        assert_eq!(asl.out_blocked(&mut p, a), None);
    }

    #[test]
    fn descriptors_stay_sorted_by_address() {
        let mut p = pool();
        let mut asl = Asl::new();
        for (i, addr) in [0x500u32, 0x100, 0x300].iter().enumerate() {
            let pid = p.alloc().unwrap();
            assert_eq!(pid, i);
            asl.insert_blocked(&mut p, *addr, pid);
        }
        assert_eq!(asl.active(), vec![0x100, 0x300, 0x500]);
    }

    #[test]
    fn semspace_defaults_and_presets() {
        let mut s = SemSpace::new();
        assert_eq!(s.get(0x42), 0);
        assert_eq!(s.dec(0x42), -1);
        assert_eq!(s.inc(0x42), 0);
        s.define(0x99, 1);
        assert_eq!(s.dec(0x99), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Block { sem: u32, slot: usize },
            WakeHead { sem: u32 },
            Yank { slot: usize },
        }

        fn step_strategy() -> impl Strategy<Value = Step> {
            let sems = prop_oneof![Just(0x10u32), Just(0x20), Just(0x30)];
            prop_oneof![
                (sems.clone(), 0..MAX_PROC).prop_map(|(sem, slot)| Step::Block { sem, slot }),
                sems.prop_map(|sem| Step::WakeHead { sem }),
                (0..MAX_PROC).prop_map(|slot| Step::Yank { slot }),
            ]
        }

        proptest! {
            // P3/P4 shape: every blocked PCB is in exactly one queue and
            // points back at it; every descriptor has a non-empty queue.
            #[test]
            fn containment_invariants_hold(steps in proptest::collection::vec(step_strategy(), 1..60)) {
                let mut p = pool();
                let pids: Vec<_> = (0..MAX_PROC).map(|_| p.alloc().unwrap()).collect();
                let mut asl = Asl::new();

                for step in steps {
                    match step {
                        Step::Block { sem, slot } => {
                            let pid = pids[slot];
                            if p.get(pid).blocked_on().is_none() {
                                asl.insert_blocked(&mut p, sem, pid);
                            }
                        }
                        Step::WakeHead { sem } => {
                            if let Some(pid) = asl.remove_blocked(&mut p, sem) {
                                p.get_mut(pid).location = Location::Ready(crate::nucleus::pcb::Prio::High);
                            }
                        }
                        Step::Yank { slot } => {
                            if asl.out_blocked(&mut p, pids[slot]).is_some() {
                                p.get_mut(pids[slot]).location = Location::Ready(crate::nucleus::pcb::Prio::High);
                            }
                        }
                    }

                    // Each active descriptor is non-empty and its members
                    // point back at it.
                    let mut seen = 0usize;
                    for sem in asl.active() {
                        prop_assert!(asl.queue_len(sem) > 0);
                        prop_assert!(asl.head_blocked(&p, sem).is_some());
                        seen += asl.queue_len(sem);
                    }
                    // Every PCB tagged blocked is accounted for exactly once.
                    let tagged = pids
                        .iter()
                        .filter(|&&pid| p.get(pid).blocked_on().is_some())
                        .count();
                    prop_assert_eq!(seen, tagged);
                }
            }
        }
    }
}
