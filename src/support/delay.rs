/*!
The delay facility: Active Delay List and its daemon.

The ADL is a singly-linked list of wakeup descriptors sorted ascending by
wake time, threaded through a fixed arena with head (wake 0) and tail
(wake MAX) sentinels so insertion never special-cases the ends. One
descriptor per delayed process, plus the two sentinels.

The daemon is an ordinary kernel-mode process: every pseudo-clock tick it
takes the list mutex, pops every expired descriptor, signals the private
semaphore of each owner whose support structure is still occupied, and
releases the mutex. Delay(s) inserts under the same mutex and then
releases-and-waits back to back, so the daemon can never signal a private
semaphore that nobody is about to P.
*/

use log::trace;

use crate::consts::*;
use crate::program::{Action, Ctx, Program};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    wake: u64,
    asid: usize,
    next: usize,
}

/// Sorted wakeup list over a fixed descriptor pool.
pub struct Adl {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

impl Adl {
    pub fn new() -> Self {
        let mut nodes = vec![
            Node {
                wake: 0,
                asid: 0,
                next: NIL,
            };
            ADL_POOL_SIZE
        ];
        nodes[HEAD] = Node {
            wake: 0,
            asid: 0,
            next: TAIL,
        };
        nodes[TAIL] = Node {
            wake: u64::MAX,
            asid: 0,
            next: NIL,
        };
        Adl {
            nodes,
            free: (2..ADL_POOL_SIZE).rev().collect(),
        }
    }

    /// Insert a wakeup, keeping ascending order (FIFO among equal times).
    /// False when the descriptor pool is exhausted.
    pub fn insert(&mut self, wake: u64, asid: usize) -> bool {
        let Some(idx) = self.free.pop() else {
            return false;
        };
        let mut cur = HEAD;
        while self.nodes[self.nodes[cur].next].wake <= wake {
            cur = self.nodes[cur].next;
        }
        self.nodes[idx] = Node {
            wake,
            asid,
            next: self.nodes[cur].next,
        };
        self.nodes[cur].next = idx;
        true
    }

    /// Unlink and return the owners of every descriptor with wake ≤ now, in
    /// wake order.
    pub fn take_expired(&mut self, now: u64) -> Vec<usize> {
        let mut out = Vec::new();
        while self.nodes[self.nodes[HEAD].next].wake <= now {
            let idx = self.nodes[HEAD].next;
            out.push(self.nodes[idx].asid);
            self.nodes[HEAD].next = self.nodes[idx].next;
            self.free.push(idx);
        }
        out
    }

    /// Earliest pending wake time, if any descriptor is queued.
    pub fn next_wake(&self) -> Option<u64> {
        let first = self.nodes[HEAD].next;
        (first != TAIL).then(|| self.nodes[first].wake)
    }

    pub fn len(&self) -> usize {
        ADL_POOL_SIZE - 2 - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Adl {
    fn default() -> Self {
        Adl::new()
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DaemonStage {
    WaitTick,
    TakeMutex,
    Scan,
    Wake,
}

/// Kernel-mode process driving the ADL off the pseudo-clock.
pub struct DelayDaemon {
    stage: DaemonStage,
    wakes: Vec<usize>,
    widx: usize,
}

impl DelayDaemon {
    pub fn new() -> Self {
        DelayDaemon {
            stage: DaemonStage::WaitTick,
            wakes: Vec::new(),
            widx: 0,
        }
    }
}

impl Default for DelayDaemon {
    fn default() -> Self {
        DelayDaemon::new()
    }
}

impl Program for DelayDaemon {
    fn next(&mut self, cx: &mut Ctx<'_>) -> Action {
        loop {
            match self.stage {
                DaemonStage::WaitTick => {
                    self.stage = DaemonStage::TakeMutex;
                    return Action::Syscall {
                        code: SYS_WAIT_CLOCK,
                        a1: 0,
                        a2: 0,
                        a3: 0,
                    };
                }
                DaemonStage::TakeMutex => {
                    self.stage = DaemonStage::Scan;
                    return Action::Syscall {
                        code: SYS_PASSEREN,
                        a1: ADL_MUTEX_ADDR,
                        a2: 0,
                        a3: 0,
                    };
                }
                DaemonStage::Scan => {
                    let now = cx.machine.now();
                    self.wakes = cx
                        .support
                        .adl
                        .take_expired(now)
                        .into_iter()
                        // Skip owners that died while queued.
                        .filter(|&asid| cx.support.get(asid).is_some())
                        .collect();
                    self.widx = 0;
                    if !self.wakes.is_empty() {
                        trace!("delay daemon waking {:?} at {now}us", self.wakes);
                    }
                    self.stage = DaemonStage::Wake;
                }
                DaemonStage::Wake => {
                    if self.widx < self.wakes.len() {
                        let asid = self.wakes[self.widx];
                        self.widx += 1;
                        return Action::Syscall {
                            code: SYS_VERHOGEN,
                            a1: private_sem_addr(asid),
                            a2: 0,
                            a3: 0,
                        };
                    }
                    self.stage = DaemonStage::WaitTick;
                    return Action::Syscall {
                        code: SYS_VERHOGEN,
                        a1: ADL_MUTEX_ADDR,
                        a2: 0,
                        a3: 0,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_stay_sorted_and_fifo_for_ties() {
        let mut adl = Adl::new();
        assert!(adl.insert(300, 3));
        assert!(adl.insert(100, 1));
        assert!(adl.insert(200, 2));
        assert!(adl.insert(200, 4));
        assert_eq!(adl.next_wake(), Some(100));
        assert_eq!(adl.take_expired(250), vec![1, 2, 4]);
        assert_eq!(adl.take_expired(250), Vec::<usize>::new());
        assert_eq!(adl.take_expired(300), vec![3]);
        assert!(adl.is_empty());
    }

    #[test]
    fn pool_exhaustion_reports_failure() {
        let mut adl = Adl::new();
        for i in 0..ADL_POOL_SIZE - 2 {
            assert!(adl.insert(10, i));
        }
        assert!(!adl.insert(10, 99));
        // Draining frees the descriptors again.
        assert_eq!(adl.take_expired(10).len(), ADL_POOL_SIZE - 2);
        assert!(adl.insert(10, 0));
    }

    #[test]
    fn sentinels_survive_draining() {
        let mut adl = Adl::new();
        assert_eq!(adl.take_expired(u64::MAX - 1), Vec::<usize>::new());
        assert!(adl.insert(5, 1));
        assert_eq!(adl.take_expired(u64::MAX - 1), vec![1]);
        assert_eq!(adl.next_wake(), None);
    }
}
