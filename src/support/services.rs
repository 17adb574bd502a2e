/*!
Support-level services: syscalls 9..18 and user-process teardown.

Each service is a resumable state machine entered from the general
exception pass-up. A service either finishes (writing its result into v0
of the saved general state, stepping the saved PC past the trap, and
reloading that state) or decides the caller must die, in which case it
becomes a `Terminator`.

Rules enforced here, not in the nucleus:
- unknown service numbers and program traps terminate the process;
- buffers must lie in the user segment (page-aligned for the block
  services), lengths in (0, 128];
- flash blocks below the backing-store reservation are unreachable;
- device errors surface as the negated device status.

User buffers are touched through ordinary virtual loads/stores, so a
service can take, and transparently recover from, page faults while it
runs. The block services probe the user page first and then move whole
frames between user memory and the per-device DMA buffer.
*/

use log::{trace, warn};

use crate::consts::*;
use crate::program::{Action, Ctx, ExcSlot};
use crate::state::{ExcCode, ProcessorState};
use crate::support::blockio::{BlockIo, IoStep};
use crate::support::page_index;

/// Write the service result into the saved general state and reload it.
fn finish(cx: &mut Ctx<'_>, asid: usize, result: u32) -> Action {
    if let Some(s) = cx.support.get_mut(asid) {
        let g = &mut s.saved[ExcSlot::General.index()];
        g.set_v0(result);
        g.advance_pc();
    }
    Action::Resume(ExcSlot::General)
}

fn negate(status: u32) -> u32 {
    (-(status as i32)) as u32
}

fn p(sem: u32) -> Action {
    Action::Syscall {
        code: SYS_PASSEREN,
        a1: sem,
        a2: 0,
        a3: 0,
    }
}

fn v(sem: u32) -> Action {
    Action::Syscall {
        code: SYS_VERHOGEN,
        a1: sem,
        a2: 0,
        a3: 0,
    }
}

// ---------------------------------------------------------------------------
// Termination cleanup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermStage {
    Start,
    AwaitSwapMutex,
    AwaitSwapRelease,
    AwaitMutexRelease,
    AwaitMaster,
    Gone,
}

/// Orderly exit of a user process: scrub its swap-pool entries under the
/// swap mutex, return the support structure, release any held device
/// mutex, signal the master semaphore, and finally hand the PCB to the
/// nucleus terminate.
#[derive(Debug)]
pub struct Terminator {
    stage: TermStage,
    held: Option<u32>,
}

impl Terminator {
    pub fn new() -> Self {
        Terminator {
            stage: TermStage::Start,
            held: None,
        }
    }

    pub fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        match self.stage {
            TermStage::Start => {
                let holding = cx.support.get(asid).is_some_and(|s| s.holding_swap);
                if holding {
                    self.sweep(cx, asid);
                    self.stage = TermStage::AwaitSwapRelease;
                    v(SWAP_MUTEX_ADDR)
                } else {
                    self.stage = TermStage::AwaitSwapMutex;
                    p(SWAP_MUTEX_ADDR)
                }
            }
            TermStage::AwaitSwapMutex => {
                self.sweep(cx, asid);
                self.stage = TermStage::AwaitSwapRelease;
                v(SWAP_MUTEX_ADDR)
            }
            TermStage::AwaitSwapRelease => {
                // Return the structure, remembering what it still held.
                self.held = cx.support.get_mut(asid).and_then(|s| s.held_mutex.take());
                cx.support.free(asid);
                trace!("asid {asid} support structure returned");
                match self.held {
                    Some(m) => {
                        self.stage = TermStage::AwaitMutexRelease;
                        v(m)
                    }
                    None => {
                        self.stage = TermStage::AwaitMaster;
                        v(MASTER_SEM_ADDR)
                    }
                }
            }
            TermStage::AwaitMutexRelease => {
                self.stage = TermStage::AwaitMaster;
                v(MASTER_SEM_ADDR)
            }
            TermStage::AwaitMaster | TermStage::Gone => {
                self.stage = TermStage::Gone;
                Action::Syscall {
                    code: SYS_TERMINATE_PROCESS,
                    a1: 0,
                    a2: 0,
                    a3: 0,
                }
            }
        }
    }

    /// Drop every swap frame this address space owns and scrub the TLB.
    /// Runs with the swap mutex held, in one un-interleaved step.
    fn sweep(&mut self, cx: &mut Ctx<'_>, asid: usize) {
        let released = cx.support.release_frames_of(asid);
        for (vpn, _) in &released {
            if let Some(slot) = cx.machine.tlb.probe(*vpn, asid) {
                cx.machine.tlb.write(slot, 0, 0);
            }
        }
        if let Some(s) = cx.support.get_mut(asid) {
            s.holding_swap = false;
        }
        if !released.is_empty() {
            trace!("asid {asid} released {} swap frames", released.len());
        }
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Terminator::new()
    }
}

// ---------------------------------------------------------------------------
// Character I/O (printer / terminal write)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WcStage {
    Validate,
    AwaitMutex,
    AwaitByte,
    AwaitIo,
    AwaitRelease,
}

#[derive(Debug)]
struct WriteChars {
    terminal: bool,
    buf: u32,
    len: u32,
    i: u32,
    error: Option<u32>,
    stage: WcStage,
}

impl WriteChars {
    fn mutex(&self, asid: usize) -> u32 {
        let line = if self.terminal {
            LINE_TERMINAL
        } else {
            LINE_PRINTER
        };
        dev_mutex_addr(dev_sem_index(line, asid - 1, false))
    }

    fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        let dev = asid - 1;
        match self.stage {
            WcStage::Validate => {
                let end_ok = self
                    .buf
                    .checked_add(self.len)
                    .is_some_and(|end| end <= USTACK_TOP);
                if self.buf < KUSEG_BASE || !end_ok || self.len == 0 || self.len > MAX_IO_LEN {
                    warn!("asid {asid}: bad write buffer {:#x}+{}", self.buf, self.len);
                    return SvcStep::Die;
                }
                self.stage = WcStage::AwaitMutex;
                SvcStep::Act(p(self.mutex(asid)))
            }
            WcStage::AwaitMutex => {
                if let Some(s) = cx.support.get_mut(asid) {
                    s.held_mutex = Some(self.mutex(asid));
                }
                self.stage = WcStage::AwaitByte;
                SvcStep::Act(Action::LoadByte(self.buf))
            }
            WcStage::AwaitByte => {
                let ch = cx.resume.loaded.unwrap_or(0) & 0xFF;
                if self.terminal {
                    cx.machine.dev_write(
                        LINE_TERMINAL,
                        dev,
                        REG_TRANSM_COMMAND,
                        (ch << 8) | TERM_TRANSMIT,
                    );
                } else {
                    cx.machine.dev_write(LINE_PRINTER, dev, REG_DATA0, ch);
                    cx.machine
                        .dev_write(LINE_PRINTER, dev, REG_COMMAND, PRINTER_PRINTCHR);
                }
                let line = if self.terminal {
                    LINE_TERMINAL
                } else {
                    LINE_PRINTER
                };
                self.stage = WcStage::AwaitIo;
                SvcStep::Act(Action::Syscall {
                    code: SYS_WAIT_IO,
                    a1: line as u32,
                    a2: dev as u32,
                    a3: 0,
                })
            }
            WcStage::AwaitIo => {
                let status = cx.resume.v0;
                let ok = if self.terminal {
                    status & 0xFF == STAT_CHAR_OK
                } else {
                    status == STAT_READY
                };
                if !ok {
                    self.error = Some(negate(status));
                } else {
                    self.i += 1;
                }
                if self.error.is_none() && self.i < self.len {
                    self.stage = WcStage::AwaitByte;
                    return SvcStep::Act(Action::LoadByte(self.buf + self.i));
                }
                if let Some(s) = cx.support.get_mut(asid) {
                    s.held_mutex = None;
                }
                self.stage = WcStage::AwaitRelease;
                SvcStep::Act(v(self.mutex(asid)))
            }
            WcStage::AwaitRelease => SvcStep::Finish(self.error.unwrap_or(self.i)),
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal read
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtStage {
    Validate,
    AwaitMutex,
    AwaitChar,
    AwaitStore,
    AwaitRelease,
}

#[derive(Debug)]
struct ReadTerminal {
    buf: u32,
    count: u32,
    last: u32,
    error: Option<u32>,
    stage: RtStage,
}

impl ReadTerminal {
    fn mutex(&self, asid: usize) -> u32 {
        dev_mutex_addr(dev_sem_index(LINE_TERMINAL, asid - 1, true))
    }

    fn receive(&mut self, cx: &mut Ctx<'_>, dev: usize) -> SvcStep {
        cx.machine
            .dev_write(LINE_TERMINAL, dev, REG_RECV_COMMAND, TERM_RECEIVE);
        self.stage = RtStage::AwaitChar;
        SvcStep::Act(Action::Syscall {
            code: SYS_WAIT_IO,
            a1: LINE_TERMINAL as u32,
            a2: dev as u32,
            a3: 1,
        })
    }

    fn release(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        if let Some(s) = cx.support.get_mut(asid) {
            s.held_mutex = None;
        }
        self.stage = RtStage::AwaitRelease;
        SvcStep::Act(v(self.mutex(asid)))
    }

    fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        let dev = asid - 1;
        match self.stage {
            RtStage::Validate => {
                let end_ok = self
                    .buf
                    .checked_add(MAX_IO_LEN)
                    .is_some_and(|end| end <= USTACK_TOP);
                if self.buf < KUSEG_BASE || !end_ok {
                    warn!("asid {asid}: bad read buffer {:#x}", self.buf);
                    return SvcStep::Die;
                }
                self.stage = RtStage::AwaitMutex;
                SvcStep::Act(p(self.mutex(asid)))
            }
            RtStage::AwaitMutex => {
                if let Some(s) = cx.support.get_mut(asid) {
                    s.held_mutex = Some(self.mutex(asid));
                }
                self.receive(cx, dev)
            }
            RtStage::AwaitChar => {
                let status = cx.resume.v0;
                if status & 0xFF != STAT_CHAR_OK {
                    self.error = Some(negate(status));
                    return self.release(cx, asid);
                }
                let ch = (status >> 8) & 0xFF;
                if ch == TERM_EOT as u32 {
                    // Input ran dry: end of transmission, nothing stored.
                    return self.release(cx, asid);
                }
                self.last = ch;
                self.stage = RtStage::AwaitStore;
                SvcStep::Act(Action::StoreByte(self.buf + self.count, ch as u8))
            }
            RtStage::AwaitStore => {
                self.count += 1;
                if self.last == u32::from(b'\n') || self.count >= MAX_IO_LEN {
                    return self.release(cx, asid);
                }
                self.receive(cx, dev)
            }
            RtStage::AwaitRelease => SvcStep::Finish(self.error.unwrap_or(self.count)),
        }
    }
}

// ---------------------------------------------------------------------------
// Disk / flash block services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwStage {
    Validate,
    AwaitProbeLoad,
    AwaitProbeStore,
    AwaitIo,
}

#[derive(Debug)]
struct BlockRw {
    disk: bool,
    /// Put: user memory to device. Get: device to user memory.
    put: bool,
    buf: u32,
    dev: u32,
    target: u32,
    io: Option<BlockIo>,
    /// Set once the device transfer succeeded; a Get whose user page was
    /// evicted while it waited re-probes instead of re-running the I/O.
    xferred: bool,
    status: u32,
    stage: RwStage,
}

impl BlockRw {
    fn dma_frame(&self) -> u32 {
        if self.disk {
            frame_addr(DISK_DMA_FRAME + self.dev as usize)
        } else {
            frame_addr(FLASH_DMA_FRAME + self.dev as usize)
        }
    }

    /// Physical frame backing the user buffer page. Probed just before, so
    /// the translation is valid; the swap mutex is not needed because no
    /// schedulable point separates probe and copy.
    fn user_frame(&self, cx: &Ctx<'_>, asid: usize) -> Option<u32> {
        let idx = page_index(self.buf >> 12)?;
        let pte = cx.support.get(asid)?.page_table[idx];
        pte.valid().then(|| pte.frame_addr())
    }

    fn start_io(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        if self.put {
            let Some(user) = self.user_frame(cx, asid) else {
                return SvcStep::Die;
            };
            cx.machine.ram.copy_frame(user, self.dma_frame());
        }
        self.io = Some(if self.disk {
            BlockIo::disk(self.dev as usize, self.target, self.dma_frame(), self.put)
        } else {
            BlockIo::flash(self.dev as usize, self.target, self.dma_frame(), self.put)
        });
        self.stage = RwStage::AwaitIo;
        match self.io.as_mut().unwrap().step(cx, Some(asid)) {
            IoStep::Do(a) => SvcStep::Act(a),
            IoStep::Done(_) => unreachable!("fresh block io cannot be done"),
        }
    }

    fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        match self.stage {
            RwStage::Validate => {
                let aligned = self.buf % PAGE_SIZE as u32 == 0;
                let in_seg = self.buf >= KUSEG_BASE && self.buf + (PAGE_SIZE as u32) <= USTACK_TOP;
                let dev_ok = (self.dev as usize) < DEV_PER_LINE;
                let target_ok = if self.disk {
                    (self.target as i32) >= 0
                        && self.target < BlockIo::disk_capacity(cx.machine, self.dev as usize)
                } else {
                    self.target >= FLASH_RESERVED_BLOCKS
                };
                if !aligned || !in_seg || !dev_ok || !target_ok {
                    warn!(
                        "asid {asid}: bad block io (buf {:#x}, dev {}, target {})",
                        self.buf, self.dev, self.target
                    );
                    return SvcStep::Die;
                }
                // Fault the user page in: a load suffices for Put; Get also
                // needs the page writable (and marked dirty).
                self.stage = RwStage::AwaitProbeLoad;
                SvcStep::Act(Action::LoadByte(self.buf))
            }
            RwStage::AwaitProbeLoad => {
                if self.put {
                    self.start_io(cx, asid)
                } else {
                    let byte = (cx.resume.loaded.unwrap_or(0) & 0xFF) as u8;
                    self.stage = RwStage::AwaitProbeStore;
                    SvcStep::Act(Action::StoreByte(self.buf, byte))
                }
            }
            RwStage::AwaitProbeStore => {
                if self.xferred {
                    // Freshly re-probed after the transfer; the page is
                    // resident and writable now.
                    let Some(user) = self.user_frame(cx, asid) else {
                        return SvcStep::Die;
                    };
                    cx.machine.ram.copy_frame(self.dma_frame(), user);
                    SvcStep::Finish(self.status)
                } else {
                    self.start_io(cx, asid)
                }
            }
            RwStage::AwaitIo => match self.io.as_mut().expect("io missing").step(cx, Some(asid)) {
                IoStep::Do(a) => SvcStep::Act(a),
                IoStep::Done(status) => {
                    if status != STAT_READY {
                        return SvcStep::Finish(negate(status));
                    }
                    if self.put {
                        return SvcStep::Finish(status);
                    }
                    match self.user_frame(cx, asid) {
                        Some(user) => {
                            cx.machine.ram.copy_frame(self.dma_frame(), user);
                            SvcStep::Finish(status)
                        }
                        None => {
                            // The target page was evicted while we waited on
                            // the device. Fault it back in, then copy.
                            self.xferred = true;
                            self.status = status;
                            self.stage = RwStage::AwaitProbeLoad;
                            SvcStep::Act(Action::LoadByte(self.buf))
                        }
                    }
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayStage {
    Validate,
    AwaitMutex,
    AwaitHandoff,
    AwaitWake,
    FailRelease,
}

#[derive(Debug)]
struct Delay {
    seconds: i32,
    stage: DelayStage,
}

impl Delay {
    fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> SvcStep {
        match self.stage {
            DelayStage::Validate => {
                if self.seconds < 0 {
                    warn!("asid {asid}: negative delay {}", self.seconds);
                    return SvcStep::Die;
                }
                self.stage = DelayStage::AwaitMutex;
                SvcStep::Act(p(ADL_MUTEX_ADDR))
            }
            DelayStage::AwaitMutex => {
                let wake = cx.machine.now() + self.seconds as u64 * 1_000_000;
                if !cx.support.adl.insert(wake, asid) {
                    // Descriptor pool dry; undo the lock and die.
                    self.stage = DelayStage::FailRelease;
                    return SvcStep::Act(v(ADL_MUTEX_ADDR));
                }
                trace!("asid {asid} delayed until {wake}us");
                // Release the list and wait on the private semaphore with no
                // schedulable point in between: the daemon cannot signal
                // before the P is down.
                self.stage = DelayStage::AwaitHandoff;
                SvcStep::Act(v(ADL_MUTEX_ADDR))
            }
            DelayStage::AwaitHandoff => {
                self.stage = DelayStage::AwaitWake;
                SvcStep::Act(p(private_sem_addr(asid)))
            }
            DelayStage::AwaitWake => SvcStep::Finish(0),
            DelayStage::FailRelease => SvcStep::Die,
        }
    }
}

// ---------------------------------------------------------------------------
// Service dispatch
// ---------------------------------------------------------------------------

enum SvcStep {
    Act(Action),
    Finish(u32),
    Die,
}

enum Kind {
    Term,
    GetTod { asked: bool },
    Write(WriteChars),
    Read(ReadTerminal),
    Rw(BlockRw),
    Delay(Delay),
}

/// A general-exception handler activation: decoded once from the saved
/// state, then stepped until it reloads the saved state or terminates the
/// process.
pub struct Service {
    kind: Kind,
    die: Option<Terminator>,
}

impl Service {
    /// Decode the pass-up. Program traps and unknown service numbers go
    /// straight to termination.
    pub fn from_saved(saved: &ProcessorState) -> Self {
        let kind = if saved.cause.exc_code() != Some(ExcCode::Syscall) {
            warn!(
                "user-level program trap ({:?}), terminating",
                saved.cause.exc_code()
            );
            Kind::Term
        } else {
            let (a1, a2, a3) = (saved.a(1), saved.a(2), saved.a(3));
            match saved.a(0) {
                SYS_TERMINATE => Kind::Term,
                SYS_GET_TOD => Kind::GetTod { asked: false },
                SYS_WRITE_PRINTER | SYS_WRITE_TERMINAL => Kind::Write(WriteChars {
                    terminal: saved.a(0) == SYS_WRITE_TERMINAL,
                    buf: a1,
                    len: a2,
                    i: 0,
                    error: None,
                    stage: WcStage::Validate,
                }),
                SYS_READ_TERMINAL => Kind::Read(ReadTerminal {
                    buf: a1,
                    count: 0,
                    last: 0,
                    error: None,
                    stage: RtStage::Validate,
                }),
                SYS_DISK_PUT | SYS_DISK_GET | SYS_FLASH_PUT | SYS_FLASH_GET => {
                    let code = saved.a(0);
                    Kind::Rw(BlockRw {
                        disk: code == SYS_DISK_PUT || code == SYS_DISK_GET,
                        put: code == SYS_DISK_PUT || code == SYS_FLASH_PUT,
                        buf: a1,
                        dev: a2,
                        target: a3,
                        io: None,
                        xferred: false,
                        status: 0,
                        stage: RwStage::Validate,
                    })
                }
                SYS_DELAY => Kind::Delay(Delay {
                    seconds: a1 as i32,
                    stage: DelayStage::Validate,
                }),
                other => {
                    warn!("unknown service {other}, terminating");
                    Kind::Term
                }
            }
        };
        Service { kind, die: None }
    }

    pub fn step(&mut self, cx: &mut Ctx<'_>, asid: usize) -> Action {
        if let Some(t) = self.die.as_mut() {
            return t.step(cx, asid);
        }
        let step = match &mut self.kind {
            Kind::Term => SvcStep::Die,
            Kind::GetTod { asked } => {
                if *asked {
                    SvcStep::Finish(cx.resume.v0)
                } else {
                    *asked = true;
                    SvcStep::Act(Action::Syscall {
                        code: SYS_GET_CPU_TIME,
                        a1: 0,
                        a2: 0,
                        a3: 0,
                    })
                }
            }
            Kind::Write(w) => w.step(cx, asid),
            Kind::Read(r) => r.step(cx, asid),
            Kind::Rw(rw) => rw.step(cx, asid),
            Kind::Delay(d) => d.step(cx, asid),
        };
        match step {
            SvcStep::Act(a) => a,
            SvcStep::Finish(result) => finish(cx, asid, result),
            SvcStep::Die => {
                let mut t = Terminator::new();
                let a = t.step(cx, asid);
                self.die = Some(t);
                a
            }
        }
    }
}
