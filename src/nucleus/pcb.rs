/*!
PCB pool, process queues, and the process tree.

Fixed-capacity arena of process control blocks addressed by stable small
indices (`Pid`). Queues are FIFO circular doubly-linked lists threaded
through the arena's `prev`/`next` fields. A PCB is on at most one queue at
a time, recorded in its `location` tag together with *which* structure
holds it (ready queue, semaphore queue, the current slot). The parent/child
tree is a singly-linked child list with a parent back-index.

Allocation zero-initializes every field, the saved register file included.
Freeing a PCB that is still linked somewhere is a caller bug; the pool does
not police it.
*/

use crate::program::Program;
use crate::state::ProcessorState;

pub type Pid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prio {
    High,
    Low,
}

/// Where a live PCB currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Free,
    Ready(Prio),
    /// Blocked on the semaphore with this address (present in its ASL queue).
    Blocked(u32),
    Current,
}

/// Execution left over from a preempted or faulted action, replayed before
/// the body is consulted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWork {
    /// Microseconds of computation still owed.
    Compute(u64),
    /// A memory access that has not retired yet (page fault in progress).
    Access(Access),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub kind: AccessKind,
    pub addr: u32,
    pub val: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    LoadWord,
    LoadByte,
    StoreWord,
    StoreByte,
}

pub struct Pcb {
    pub state: ProcessorState,
    /// Accumulated CPU time, microseconds.
    pub cpu_time: u64,
    /// Support-structure ASID, if this process has a support level.
    pub support: Option<usize>,
    pub parent: Option<Pid>,
    pub first_child: Option<Pid>,
    pub next_sibling: Option<Pid>,
    pub location: Location,
    pub body: Option<Box<dyn Program>>,
    pub pending: Option<PendingWork>,
    /// Result of the last completed load, consumed by the next body step.
    pub load_result: Option<u32>,
    /// Pass-up delivered but handler not yet entered, per exception slot.
    pub passup_pending: [bool; 2],
    /// Running page-fault handler (the pager), if any.
    pub pf_task: Option<crate::support::pager::Pager>,
    /// Running general-exception handler (syscalls 9..18 / traps), if any.
    pub gen_task: Option<crate::support::services::Service>,
    // Queue links (meaningful only while location is Ready/Blocked).
    prev: Pid,
    next: Pid,
}

impl Pcb {
    fn cleared() -> Self {
        Pcb {
            state: ProcessorState::default(),
            cpu_time: 0,
            support: None,
            parent: None,
            first_child: None,
            next_sibling: None,
            location: Location::Free,
            body: None,
            pending: None,
            load_result: None,
            passup_pending: [false; 2],
            pf_task: None,
            gen_task: None,
            prev: 0,
            next: 0,
        }
    }

    pub fn blocked_on(&self) -> Option<u32> {
        match self.location {
            Location::Blocked(addr) => Some(addr),
            _ => None,
        }
    }
}

pub struct PcbPool {
    slots: Vec<Pcb>,
    free: Vec<Pid>,
}

impl PcbPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Pcb::cleared());
        }
        // Pop order makes low indices go out first, which keeps test
        // transcripts readable.
        let free = (0..capacity).rev().collect();
        PcbPool { slots, free }
    }

    pub fn alloc(&mut self) -> Option<Pid> {
        let pid = self.free.pop()?;
        self.slots[pid] = Pcb::cleared();
        Some(pid)
    }

    pub fn free(&mut self, pid: Pid) {
        debug_assert!(!self.free.contains(&pid));
        self.slots[pid] = Pcb::cleared();
        self.free.push(pid);
    }

    pub fn get(&self, pid: Pid) -> &Pcb {
        &self.slots[pid]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Pcb {
        &mut self.slots[pid]
    }

    /// True if the slot is back on the free list (the pid was freed).
    pub fn is_free(&self, pid: Pid) -> bool {
        self.free.contains(&pid)
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // ------------------------------------------------------------------
    // Process tree
    // ------------------------------------------------------------------

    /// Make `child` the youngest child of `parent`.
    pub fn insert_child(&mut self, parent: Pid, child: Pid) {
        self.slots[child].parent = Some(parent);
        self.slots[child].next_sibling = self.slots[parent].first_child;
        self.slots[parent].first_child = Some(child);
    }

    pub fn remove_first_child(&mut self, parent: Pid) -> Option<Pid> {
        let child = self.slots[parent].first_child?;
        self.slots[parent].first_child = self.slots[child].next_sibling;
        self.slots[child].parent = None;
        self.slots[child].next_sibling = None;
        Some(child)
    }

    /// Unlink `pid` from its parent's child list, wherever it sits in it.
    pub fn detach_from_parent(&mut self, pid: Pid) {
        let Some(parent) = self.slots[pid].parent else {
            return;
        };
        let mut cur = self.slots[parent].first_child;
        if cur == Some(pid) {
            self.slots[parent].first_child = self.slots[pid].next_sibling;
        } else {
            while let Some(c) = cur {
                if self.slots[c].next_sibling == Some(pid) {
                    self.slots[c].next_sibling = self.slots[pid].next_sibling;
                    break;
                }
                cur = self.slots[c].next_sibling;
            }
        }
        self.slots[pid].parent = None;
        self.slots[pid].next_sibling = None;
    }
}

/// FIFO circular queue threaded through the PCB arena. The queue itself
/// only stores the tail index; `tail.next` is the head.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcQueue {
    tail: Option<Pid>,
    len: usize,
}

impl ProcQueue {
    pub fn new() -> Self {
        ProcQueue { tail: None, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self, pool: &PcbPool) -> Option<Pid> {
        self.tail.map(|t| pool.get(t).next)
    }

    /// Append at the tail.
    pub fn insert(&mut self, pool: &mut PcbPool, pid: Pid) {
        match self.tail {
            None => {
                pool.get_mut(pid).next = pid;
                pool.get_mut(pid).prev = pid;
            }
            Some(tail) => {
                let head = pool.get(tail).next;
                pool.get_mut(pid).next = head;
                pool.get_mut(pid).prev = tail;
                pool.get_mut(tail).next = pid;
                pool.get_mut(head).prev = pid;
            }
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    pub fn remove_head(&mut self, pool: &mut PcbPool) -> Option<Pid> {
        let head = self.head(pool)?;
        self.remove(pool, head);
        Some(head)
    }

    /// Remove a specific PCB; true if it was found on this queue.
    pub fn remove(&mut self, pool: &mut PcbPool, pid: Pid) -> bool {
        let Some(tail) = self.tail else {
            return false;
        };
        // Confirm membership by walking; queues are short (≤ MAX_PROC).
        let mut cur = pool.get(tail).next;
        loop {
            if cur == pid {
                break;
            }
            if cur == tail {
                return false;
            }
            cur = pool.get(cur).next;
        }
        let (prev, next) = (pool.get(pid).prev, pool.get(pid).next);
        if prev == pid {
            self.tail = None;
        } else {
            pool.get_mut(prev).next = next;
            pool.get_mut(next).prev = prev;
            if self.tail == Some(pid) {
                self.tail = Some(prev);
            }
        }
        pool.get_mut(pid).next = pid;
        pool.get_mut(pid).prev = pid;
        self.len -= 1;
        true
    }

    /// Pids in FIFO order, for assertions and diagnostics.
    pub fn iter(&self, pool: &PcbPool) -> Vec<Pid> {
        let mut out = Vec::with_capacity(self.len);
        let Some(tail) = self.tail else {
            return out;
        };
        let mut cur = pool.get(tail).next;
        loop {
            out.push(cur);
            if cur == tail {
                break;
            }
            cur = pool.get(cur).next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAX_PROC;

    fn pool() -> PcbPool {
        PcbPool::new(MAX_PROC)
    }

    #[test]
    fn alloc_exhausts_then_recycles() {
        let mut p = pool();
        let pids: Vec<_> = (0..MAX_PROC).map(|_| p.alloc().unwrap()).collect();
        assert_eq!(p.alloc(), None);
        assert_eq!(p.live_count(), MAX_PROC);
        p.free(pids[3]);
        assert_eq!(p.alloc(), Some(pids[3]));
    }

    #[test]
    fn alloc_zeroes_previous_contents() {
        let mut p = pool();
        let a = p.alloc().unwrap();
        p.get_mut(a).cpu_time = 1234;
        p.get_mut(a).state.set_v0(77);
        p.free(a);
        let b = p.alloc().unwrap();
        assert_eq!(a, b);
        assert_eq!(p.get(b).cpu_time, 0);
        assert_eq!(p.get(b).state.v0(), 0);
    }

    #[test]
    fn queue_is_fifo() {
        let mut p = pool();
        let mut q = ProcQueue::new();
        let (a, b, c) = (p.alloc().unwrap(), p.alloc().unwrap(), p.alloc().unwrap());
        q.insert(&mut p, a);
        q.insert(&mut p, b);
        q.insert(&mut p, c);
        assert_eq!(q.iter(&p), vec![a, b, c]);
        assert_eq!(q.remove_head(&mut p), Some(a));
        assert_eq!(q.remove_head(&mut p), Some(b));
        q.insert(&mut p, a);
        assert_eq!(q.iter(&p), vec![c, a]);
        assert_eq!(q.remove_head(&mut p), Some(c));
        assert_eq!(q.remove_head(&mut p), Some(a));
        assert_eq!(q.remove_head(&mut p), None);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_specific_from_middle_and_tail() {
        let mut p = pool();
        let mut q = ProcQueue::new();
        let pids: Vec<_> = (0..4).map(|_| p.alloc().unwrap()).collect();
        for &pid in &pids {
            q.insert(&mut p, pid);
        }
        assert!(q.remove(&mut p, pids[1]));
        assert_eq!(q.iter(&p), vec![pids[0], pids[2], pids[3]]);
        assert!(q.remove(&mut p, pids[3]));
        assert_eq!(q.iter(&p), vec![pids[0], pids[2]]);
        // Not on the queue anymore.
        assert!(!q.remove(&mut p, pids[1]));
        assert!(q.remove(&mut p, pids[0]));
        assert!(q.remove(&mut p, pids[2]));
        assert!(q.is_empty());
    }

    #[test]
    fn membership_check_rejects_foreign_pcbs() {
        let mut p = pool();
        let mut q1 = ProcQueue::new();
        let mut q2 = ProcQueue::new();
        let a = p.alloc().unwrap();
        let b = p.alloc().unwrap();
        q1.insert(&mut p, a);
        q2.insert(&mut p, b);
        assert!(!q1.remove(&mut p, b));
        assert_eq!(q2.iter(&p), vec![b]);
    }

    #[test]
    fn child_tree_insert_and_detach() {
        let mut p = pool();
        let parent = p.alloc().unwrap();
        let c1 = p.alloc().unwrap();
        let c2 = p.alloc().unwrap();
        let c3 = p.alloc().unwrap();
        p.insert_child(parent, c1);
        p.insert_child(parent, c2);
        p.insert_child(parent, c3);
        // Youngest first.
        assert_eq!(p.get(parent).first_child, Some(c3));

        p.detach_from_parent(c2);
        assert_eq!(p.get(parent).first_child, Some(c3));
        assert_eq!(p.get(c3).next_sibling, Some(c1));
        assert_eq!(p.get(c2).parent, None);

        assert_eq!(p.remove_first_child(parent), Some(c3));
        assert_eq!(p.remove_first_child(parent), Some(c1));
        assert_eq!(p.remove_first_child(parent), None);
    }
}
